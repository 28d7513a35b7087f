use healer_sched::{
    config::{Config, ConfigError},
    fuzz::{log as healer_log, ProtectRule},
    signal::Region,
    sim,
    utils::setup_signal_handler,
};
use simplelog::LevelFilter;
use std::{path::PathBuf, process::exit, time::Duration};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "healer-sched",
    about = "Drives healer's coverage tracker and corpus scheduler with a simulated target."
)]
struct Settings {
    /// Json config file, flags below override it.
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Parallel fuzzing jobs.
    #[structopt(short, long)]
    job: Option<u64>,
    /// Executions per job, 0 means run until interrupted.
    #[structopt(short = "n", long)]
    iters: Option<u64>,
    /// Seed of the simulation.
    #[structopt(long)]
    seed: Option<u64>,
    /// Coverage scope, e.g. 0xffffffff831ba096-0xffffffff838eeede,0xffffffff85b767b8-0xffffffff85b7e8d1.
    #[structopt(short, long)]
    scope: Option<Region>,
    /// Protected region, programs covering it are chosen with probability `protect-prob`.
    #[structopt(short, long)]
    protect: Vec<Region>,
    /// Selection probability of protected programs.
    #[structopt(long, default_value = "0.5")]
    protect_prob: f64,
    /// Seconds between two stats reports.
    #[structopt(long)]
    stats_interval: Option<u64>,
    /// Skip corpus minimization after fuzzing.
    #[structopt(long)]
    no_minimize: bool,
    /// Log level: off, error, warn, info, debug, trace.
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn build_config(settings: Settings) -> Result<Config, ConfigError> {
    let mut conf = match settings.config.as_ref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(job) = settings.job {
        conf.job = job;
    }
    if let Some(iters) = settings.iters {
        conf.iters = iters;
    }
    if settings.seed.is_some() {
        conf.seed = settings.seed;
    }
    if let Some(scope) = settings.scope {
        conf.scope = scope;
    }
    let base = conf.protect.len();
    for (i, region) in settings.protect.into_iter().enumerate() {
        let name = format!("protect-{}", base + i);
        conf.protect
            .push(ProtectRule::new(name, region, settings.protect_prob));
    }
    if let Some(secs) = settings.stats_interval {
        conf.stats_interval = Duration::from_secs(secs);
    }
    if settings.no_minimize {
        conf.sim.minimize = false;
    }
    conf.check()?;
    Ok(conf)
}

fn main() {
    let settings = Settings::from_args();
    if let Err(e) = healer_log::init(settings.log_level) {
        eprintln!("failed to init logger: {}", e);
    }

    let conf = match build_config(settings) {
        Ok(conf) => conf,
        Err(e) => {
            log::error!("config error: {}", e);
            exit(1);
        }
    };
    if let Err(e) = setup_signal_handler() {
        log::warn!("failed to setup signal handler: {}", e);
    }

    log::info!(
        "jobs: {}, iters: {}, scope: {}, protected regions: {}",
        conf.job,
        conf.iters,
        conf.scope,
        conf.protect.len()
    );
    let report = sim::run(conf);
    log::info!(
        "execs: {}, max signal: {}, corpus: {}, protected: {:?}",
        report.execs,
        report.max_signal,
        report.corpus_len,
        report.protected
    );
}
