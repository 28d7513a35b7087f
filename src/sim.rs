//! Simulated fuzzing loop.
//!
//! Programs are sequences of synthetic calls, executing a program yields a
//! deterministic trace per call plus a call-pair edge, with a few flaky pcs on
//! some runs. Workers drive the cover and the corpus the way a real fuzzer
//! does, a monitor drains new signal on its own cadence.

use crate::{
    config::{Config, SimConfig},
    fuzz::{
        corpus::Scheduler,
        cover::Cover,
        stats::{self, Stats},
    },
    signal::{Elem, Prio, Signal},
    utils::stop_soon,
};
use rand::{prelude::SmallRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

/// Prio of runs without flaky coverage.
pub const PRIO_STABLE: Prio = 1;
/// Prio of runs that hit flaky coverage.
pub const PRIO_FLAKY: Prio = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimProg {
    pub calls: Vec<u32>,
}

pub type ProgRef = Arc<SimProg>;

#[inline]
fn mix(mut x: u64) -> u64 {
    // splitmix64 finalizer
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

impl SimProg {
    pub fn gen(rng: &mut SmallRng, conf: &SimConfig) -> Self {
        let len = rng.gen_range(1..=conf.prog_len);
        let calls = (0..len).map(|_| rng.gen_range(0..conf.call_num)).collect();
        Self { calls }
    }

    pub fn mutate(&self, rng: &mut SmallRng, conf: &SimConfig) -> Self {
        let mut calls = self.calls.clone();
        match rng.gen_range(0..3) {
            0 if calls.len() < conf.prog_len => {
                let idx = rng.gen_range(0..=calls.len());
                calls.insert(idx, rng.gen_range(0..conf.call_num));
            }
            1 if calls.len() > 1 => {
                let idx = rng.gen_range(0..calls.len());
                calls.remove(idx);
            }
            _ => {
                let idx = rng.gen_range(0..calls.len());
                calls[idx] = rng.gen_range(0..conf.call_num);
            }
        }
        Self { calls }
    }

    /// Pcs covered by every run of this program.
    pub fn stable_trace(&self, conf: &SimConfig) -> Vec<Elem> {
        let mut trace = Vec::new();
        let mut prev = None;
        for &c in self.calls.iter() {
            let blocks = 1 + mix(c as u64) % 8;
            for b in 0..blocks {
                trace.push(pc_of(conf, mix((c as u64) << 8 | b)));
            }
            if let Some(p) = prev {
                trace.push(pc_of(conf, mix((p as u64) << 32 | c as u64 | 1 << 63)));
            }
            prev = Some(c);
        }
        trace
    }

    /// One execution, some runs cover extra random pcs.
    pub fn exec(&self, rng: &mut SmallRng, conf: &SimConfig) -> (Vec<Elem>, Prio) {
        let mut trace = self.stable_trace(conf);
        if conf.flaky != 0 && rng.gen_ratio(conf.flaky, 100) {
            for _ in 0..rng.gen_range(1..4) {
                trace.push(pc_of(conf, rng.gen()));
            }
            (trace, PRIO_FLAKY)
        } else {
            (trace, PRIO_STABLE)
        }
    }
}

#[inline]
fn pc_of(conf: &SimConfig, h: u64) -> Elem {
    conf.pc_base.wrapping_add(h % conf.pc_span)
}

pub struct Worker {
    pub id: u64,
    pub rng: SmallRng,
    pub cover: Arc<Cover>,
    pub corpus: Arc<Scheduler<ProgRef>>,
    pub stats: Arc<Stats>,
    pub conf: SimConfig,
}

impl Worker {
    pub fn fuzz_loop(&mut self, iters: u64) {
        let mut n = 0;
        while (iters == 0 || n < iters) && !stop_soon() {
            self.fuzz_one();
            n += 1;
        }
        log::debug!("worker-{}: exits after {} execs", self.id, n);
    }

    pub fn fuzz_one(&mut self) -> bool {
        let selected = if self.rng.gen_ratio(4, 5) {
            self.corpus.select_one(&mut self.rng)
        } else {
            None
        };
        let p = match selected {
            Some(p) => {
                self.stats.inc_exec(stats::OVERALL_MUTATION);
                p.mutate(&mut self.rng, &self.conf)
            }
            None => {
                self.stats.inc_exec(stats::OVERALL_GEN);
                SimProg::gen(&mut self.rng, &self.conf)
            }
        };
        let (trace, prio) = p.exec(&mut self.rng, &self.conf);
        let new = self.cover.ingest_raw(&trace, prio);
        if new.is_empty() {
            return false;
        }
        let id = self.corpus.admit(Arc::new(p), &new);
        log::trace!("worker-{}: prog {} added, new signal: {}", self.id, id, new.len());
        true
    }
}

/// Greedy set cover over the stable traces, then swaps the corpus.
pub fn minimize_corpus(corpus: &Scheduler<ProgRef>, cover: &Cover, conf: &SimConfig) -> usize {
    let scope = cover.scope();
    let snapshot = corpus.snapshot();
    let mut progs = snapshot
        .iter()
        .map(|p| {
            let trace = scope.filter(&p.stable_trace(conf));
            (Arc::clone(p), Signal::from_raw(&trace, PRIO_STABLE))
        })
        .collect::<Vec<_>>();
    progs.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut covered = Signal::new();
    let mut kept = Vec::new();
    for (p, s) in progs {
        let new = covered.diff(&s);
        if new.is_empty() {
            continue;
        }
        covered.merge(&new);
        kept.push((p, new));
    }
    let n = kept.len();
    corpus.replace_all(corpus.rebuild(kept));
    n
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
    pub execs: u64,
    pub max_signal: usize,
    pub corpus_len: usize,
    pub protected: Vec<usize>,
}

pub fn run(conf: Config) -> SimReport {
    let cover = Arc::new(Cover::with_scope(conf.scope.clone()));
    let corpus = Arc::new(Scheduler::<ProgRef>::new(conf.protect.clone()));
    let stats = Arc::new(Stats::new());
    register_gauges(&stats, &cover, &corpus);

    let mut seeder = match conf.seed {
        Some(s) => SmallRng::seed_from_u64(s),
        None => SmallRng::from_entropy(),
    };
    let start = Instant::now();
    let mut workers = Vec::with_capacity(conf.job as usize);
    for id in 0..conf.job {
        let mut worker = Worker {
            id,
            rng: SmallRng::seed_from_u64(seeder.gen()),
            cover: Arc::clone(&cover),
            corpus: Arc::clone(&corpus),
            stats: Arc::clone(&stats),
            conf: conf.sim.clone(),
        };
        let iters = conf.iters;
        workers.push(thread::spawn(move || worker.fuzz_loop(iters)));
    }

    let done = Arc::new(AtomicBool::new(false));
    let monitor = {
        let done = Arc::clone(&done);
        let cover = Arc::clone(&cover);
        let stats = Arc::clone(&stats);
        let interval = conf.stats_interval;
        thread::spawn(move || monitor_loop(&done, &cover, &stats, interval))
    };

    for (i, w) in workers.into_iter().enumerate() {
        join_or_warn(&format!("worker-{}", i), w);
    }
    done.store(true, Ordering::Relaxed);
    join_or_warn("monitor", monitor);
    stats.add(stats::SIGNAL_NEW, cover.drain_delta().len() as u64);
    log::info!(
        "fuzzing done in {}s: {}",
        start.elapsed().as_secs(),
        stats.report_line()
    );

    if conf.sim.minimize && !corpus.is_empty() {
        let before = corpus.len();
        let after = minimize_corpus(&corpus, &cover, &conf.sim);
        log::info!("minimized corpus: {} -> {}", before, after);
    }

    stats.refresh();
    SimReport {
        execs: stats.load(stats::OVERALL_EXEC_TOTAL),
        max_signal: cover.known_len(),
        corpus_len: corpus.len(),
        protected: (0..corpus.rules().len())
            .map(|i| corpus.protected_len(i))
            .collect(),
    }
}

fn join_or_warn<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("{} panicked", name);
            None
        }
    }
}

fn register_gauges(stats: &Stats, cover: &Arc<Cover>, corpus: &Arc<Scheduler<ProgRef>>) {
    let c = Arc::clone(cover);
    stats.register_gauge(stats::SIGNAL_MAX, move || c.known_len() as u64);
    let c = Arc::clone(corpus);
    stats.register_gauge(stats::CORPUS_LEN, move || c.len() as u64);
    let c = Arc::clone(corpus);
    stats.register_gauge(stats::CORPUS_SUM_PRIOS, move || c.sum_prios());
    let c = Arc::clone(corpus);
    stats.register_gauge(stats::CORPUS_PROTECTED, move || {
        (0..c.rules().len())
            .map(|i| c.protected_len(i) as u64)
            .sum()
    });
}

fn monitor_loop(done: &AtomicBool, cover: &Cover, stats: &Stats, interval: Duration) {
    const TICK: Duration = Duration::from_millis(100);
    let mut last = Instant::now();
    while !done.load(Ordering::Relaxed) {
        sleep(TICK);
        if last.elapsed() < interval {
            continue;
        }
        last = Instant::now();
        let delta = cover.drain_delta();
        stats.add(stats::SIGNAL_NEW, delta.len() as u64);
        log::info!("{}", stats.report_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_conf() -> Config {
        Config {
            job: 2,
            iters: 2000,
            seed: Some(1),
            stats_interval: Duration::from_secs(3600),
            sim: SimConfig {
                call_num: 32,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn stable_trace_is_deterministic() {
        let conf = SimConfig::default();
        let p = SimProg {
            calls: vec![1, 2, 3],
        };
        assert_eq!(p.stable_trace(&conf), p.stable_trace(&conf));
        assert!(p
            .stable_trace(&conf)
            .iter()
            .all(|&pc| pc >= conf.pc_base && pc < conf.pc_base + conf.pc_span));
    }

    #[test]
    fn mutate_keeps_bounds() {
        let conf = SimConfig::default();
        let mut rng = SmallRng::seed_from_u64(0);
        let mut p = SimProg::gen(&mut rng, &conf);
        for _ in 0..1000 {
            p = p.mutate(&mut rng, &conf);
            assert!(!p.calls.is_empty() && p.calls.len() <= conf.prog_len);
            assert!(p.calls.iter().all(|&c| c < conf.call_num));
        }
    }

    #[test]
    fn worker_grows_corpus() {
        let conf = small_conf();
        let mut w = Worker {
            id: 0,
            rng: SmallRng::seed_from_u64(0),
            cover: Arc::new(Cover::new()),
            corpus: Arc::new(Scheduler::new(Vec::new())),
            stats: Arc::new(Stats::new()),
            conf: conf.sim.clone(),
        };
        assert!(w.fuzz_one());
        w.fuzz_loop(500);
        assert_eq!(w.stats.load(stats::OVERALL_EXEC_TOTAL), 501);
        assert!(w.corpus.len() > 1);
        assert!(w.corpus.snapshot().is_consistent());
        assert!(w.cover.known_len() >= w.corpus.len());
    }

    #[test]
    fn panicked_thread_is_reported() {
        let h = thread::spawn(|| -> u64 { panic!("monitor failed") });
        assert_eq!(join_or_warn("monitor", h), None);
        let h = thread::spawn(|| 7u64);
        assert_eq!(join_or_warn("monitor", h), Some(7));
    }

    #[test]
    fn run_with_protection() {
        let mut conf = small_conf();
        let base = conf.sim.pc_base;
        let region = format!("{:#x}-{:#x}", base, base + 0x1000).parse().unwrap();
        conf.protect
            .push(crate::fuzz::corpus::ProtectRule::new("low", region, 0.5));
        conf.sim.minimize = false;
        let report = run(conf);
        assert_eq!(report.execs, 4000);
        assert!(report.corpus_len > 0);
        assert_eq!(report.protected.len(), 1);
        assert!(report.max_signal > 0);
    }

    #[test]
    fn minimize_keeps_coverage() {
        let conf = small_conf();
        let cover = Cover::new();
        let corpus = Scheduler::new(Vec::new());
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..300 {
            let p = SimProg::gen(&mut rng, &conf.sim);
            let new = cover.ingest_raw(&p.stable_trace(&conf.sim), PRIO_STABLE);
            if !new.is_empty() {
                corpus.admit(Arc::new(p), &new);
            }
        }
        let before = corpus.len();
        let mut all = Signal::new();
        for p in corpus.snapshot().iter() {
            all.merge(&Signal::from_raw(&p.stable_trace(&conf.sim), PRIO_STABLE));
        }

        let after = minimize_corpus(&corpus, &cover, &conf.sim);
        assert!(after <= before);
        assert_eq!(corpus.len(), after);
        let mut kept = Signal::new();
        for p in corpus.snapshot().iter() {
            kept.merge(&Signal::from_raw(&p.stable_trace(&conf.sim), PRIO_STABLE));
        }
        assert_eq!(kept, all);
    }
}
