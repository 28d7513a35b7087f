pub mod corpus;
pub mod cover;
pub mod log;
pub mod stats;

pub use corpus::{Corpus, CorpusId, ProgInfo, ProtectRule, Scheduler};
pub use cover::Cover;
pub use stats::Stats;
