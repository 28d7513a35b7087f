//! Coverage tracking and corpus scheduling core of healer.
//!
//! [`fuzz::cover::Cover`] deduplicates the coverage reported by executions and
//! hands out the signal that is new, [`fuzz::corpus::Scheduler`] keeps the
//! programs that brought new signal and chooses the next one to mutate.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod utils;
pub mod config;
pub mod fuzz;
pub mod signal;
pub mod sim;

pub use config::Config;
