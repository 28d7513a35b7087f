use crate::{
    fuzz::corpus::{ProtectRule, DEFAULT_PROTECT_PROB, MAX_PROTECT_RULES},
    signal::{Region, RegionError},
};
use json::JsonValue;
use std::{
    convert::TryFrom,
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("bad json: {0}")]
    Json(#[from] json::Error),
    #[error("bad region in '{field}': {source}")]
    Region { field: String, source: RegionError },
    #[error("bad field '{0}'")]
    BadField(String),
    #[error("too many protect rules: {0}, max {max}", max = MAX_PROTECT_RULES)]
    TooManyRules(usize),
    #[error("protect rule '{name}': probability {prob} not in [0, 1]")]
    BadProb { name: String, prob: f64 },
    #[error("protect rule '{0}': empty region would protect every program")]
    UnrestrictedRule(String),
    #[error("job should be greater than 0")]
    ZeroJob,
}

/// Synthetic target used by the simulation driver.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Number of distinct calls a program is made of.
    pub call_num: u32,
    /// Max calls per program.
    pub prog_len: usize,
    /// First pc of the simulated text.
    pub pc_base: u64,
    /// Size of the simulated text.
    pub pc_span: u64,
    /// Percent of executions that hit extra random pcs.
    pub flaky: u32,
    /// Run corpus minimization once workers finish.
    pub minimize: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            call_num: 256,
            prog_len: 8,
            pc_base: 0xffffffff81000000,
            pc_span: 0x100000,
            flaky: 5,
            minimize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Coverage outside of the scope is ignored.
    pub scope: Region,
    pub protect: Vec<ProtectRule>,
    pub job: u64,
    /// Executions per job, 0 means run until stopped.
    pub iters: u64,
    pub seed: Option<u64>,
    pub stats_interval: Duration,
    pub sim: SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: Region::unrestricted(),
            protect: Vec::new(),
            job: 4,
            iters: 100_000,
            seed: None,
            stats_interval: Duration::from_secs(10),
            sim: SimConfig::default(),
        }
    }
}

impl Config {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.job == 0 {
            return Err(ConfigError::ZeroJob);
        }
        if self.protect.len() > MAX_PROTECT_RULES {
            return Err(ConfigError::TooManyRules(self.protect.len()));
        }
        for r in self.protect.iter() {
            if !(0.0..=1.0).contains(&r.prob) {
                return Err(ConfigError::BadProb {
                    name: r.name.clone(),
                    prob: r.prob,
                });
            }
            if r.region.is_unrestricted() {
                return Err(ConfigError::UnrestrictedRule(r.name.clone()));
            }
        }
        if self.sim.call_num == 0
            || self.sim.prog_len == 0
            || self.sim.pc_span == 0
            || self.sim.flaky > 100
        {
            return Err(ConfigError::BadField("sim".to_string()));
        }
        Ok(())
    }

    /// Loads config from a json file, missing fields keep the default value.
    pub fn load<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Example:
    /// ```json
    /// {
    ///     "scope": "0xffffffff831ba096-0xffffffff838eeede",
    ///     "protect": [{"name": "io_uring", "region": "0xffffffff81ba06ed-0xffffffff81bd1636", "prob": 0.5}],
    ///     "job": 4,
    ///     "iters": 100000,
    ///     "seed": 1,
    ///     "stats_interval": 10,
    ///     "sim": {"call_num": 256, "prog_len": 8, "flaky": 5, "minimize": true}
    /// }
    /// ```
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let val = json::parse(content)?;
        let mut conf = Config::default();

        if !val["scope"].is_null() {
            conf.scope = parse_region("scope", &val["scope"])?;
        }
        for (i, rule) in val["protect"].members().enumerate() {
            let name = rule["name"]
                .as_str()
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("protect-{}", i));
            let region = parse_region(&name, &rule["region"])?;
            let prob = if rule["prob"].is_null() {
                DEFAULT_PROTECT_PROB
            } else {
                rule["prob"]
                    .as_f64()
                    .ok_or_else(|| ConfigError::BadField(format!("{}.prob", name)))?
            };
            conf.protect.push(ProtectRule::new(name, region, prob));
        }
        if let Some(job) = opt_u64(&val, "job")? {
            conf.job = job;
        }
        if let Some(iters) = opt_u64(&val, "iters")? {
            conf.iters = iters;
        }
        conf.seed = opt_u64(&val, "seed")?;
        if let Some(secs) = opt_u64(&val, "stats_interval")? {
            conf.stats_interval = Duration::from_secs(secs);
        }

        let sim = &val["sim"];
        if let Some(n) = opt_u64(sim, "call_num")? {
            conf.sim.call_num =
                u32::try_from(n).map_err(|_| ConfigError::BadField("call_num".to_string()))?;
        }
        if let Some(n) = opt_u64(sim, "prog_len")? {
            conf.sim.prog_len =
                usize::try_from(n).map_err(|_| ConfigError::BadField("prog_len".to_string()))?;
        }
        if let Some(n) = opt_u64(sim, "pc_base")? {
            conf.sim.pc_base = n;
        }
        if let Some(n) = opt_u64(sim, "pc_span")? {
            conf.sim.pc_span = n;
        }
        if let Some(n) = opt_u64(sim, "flaky")? {
            conf.sim.flaky = n.min(100) as u32;
        }
        if let Some(m) = sim["minimize"].as_bool() {
            conf.sim.minimize = m;
        }
        Ok(conf)
    }
}

fn opt_u64(val: &JsonValue, field: &str) -> Result<Option<u64>, ConfigError> {
    let v = &val[field];
    if v.is_null() {
        return Ok(None);
    }
    v.as_u64()
        .map(Some)
        .ok_or_else(|| ConfigError::BadField(field.to_string()))
}

/// Accepts either a string of ranges or an array of them.
fn parse_region(field: &str, val: &JsonValue) -> Result<Region, ConfigError> {
    let to_err = |source: RegionError| ConfigError::Region {
        field: field.to_string(),
        source,
    };
    if let Some(s) = val.as_str() {
        return s.parse().map_err(to_err);
    }
    if val.is_array() {
        let mut region = Region::unrestricted();
        for r in val.members() {
            let s = r
                .as_str()
                .ok_or_else(|| ConfigError::BadField(field.to_string()))?;
            region.push(s.parse().map_err(to_err)?);
        }
        return Ok(region);
    }
    Err(ConfigError::BadField(field.to_string()))
}
