use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::Instant,
};

use iota::iota;
use rustc_hash::FxHashMap;

iota! {
            // Overall
    pub const OVERALL_RUN_TIME: u64 = iota;
            , OVERALL_EXEC_TOTAL
            , OVERALL_GEN
            , OVERALL_MUTATION
            // Signal
            , SIGNAL_MAX                // size of known signal, pulled.
            , SIGNAL_NEW                // signal drained by the monitor.
            // Corpus
            , CORPUS_LEN
            , CORPUS_PROTECTED
            , CORPUS_SUM_PRIOS

            , STATS_LEN // place holder.
}

lazy_static! {
    pub static ref STATS: FxHashMap<u64, &'static str> = {
        fxhashmap! {
            OVERALL_RUN_TIME            => "run time",
            OVERALL_EXEC_TOTAL          => "exec total",
            OVERALL_GEN                 => "exec gen",
            OVERALL_MUTATION            => "exec mut",
            SIGNAL_MAX                  => "max signal",
            SIGNAL_NEW                  => "new signal",
            CORPUS_LEN                  => "length",
            CORPUS_PROTECTED            => "protected",
            CORPUS_SUM_PRIOS            => "sum prios"
        }
    };
    pub static ref GROUPS: FxHashMap<&'static str, Vec<u64>> = {
        fxhashmap! {
            "OVERALL" => vec![
                OVERALL_RUN_TIME,
                OVERALL_EXEC_TOTAL,
                OVERALL_GEN,
                OVERALL_MUTATION
            ],
            "SIGNAL" => vec![
                SIGNAL_MAX,
                SIGNAL_NEW
            ],
            "CORPUS" => vec![
                CORPUS_LEN,
                CORPUS_PROTECTED,
                CORPUS_SUM_PRIOS
            ]
        }
    };
}

/// Value of a stat computed when stats are read.
pub type Gauge = Box<dyn Fn() -> u64 + Send + Sync>;

pub struct Stats {
    start_tm: Instant,
    stats: Vec<AtomicU64>,
    gauges: RwLock<Vec<(u64, Gauge)>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_tm: Instant::now(),
            stats: (0..STATS_LEN).map(|_| AtomicU64::new(0)).collect(),
            gauges: RwLock::new(Vec::new()),
        }
    }

    pub fn inc(&self, stat: u64) -> u64 {
        self.stats[stat as usize].fetch_add(1, Ordering::Relaxed)
    }

    /// Counts one execution of kind `stat`.
    pub fn inc_exec(&self, stat: u64) -> u64 {
        if stat != OVERALL_EXEC_TOTAL {
            self.inc(OVERALL_EXEC_TOTAL);
        }
        self.inc(stat)
    }

    pub fn add(&self, stat: u64, n: u64) -> u64 {
        self.stats[stat as usize].fetch_add(n, Ordering::Relaxed)
    }

    pub fn load(&self, stat: u64) -> u64 {
        self.stats[stat as usize].load(Ordering::Relaxed)
    }

    pub fn store(&self, stat: u64, val: u64) {
        self.stats[stat as usize].store(val, Ordering::Relaxed);
    }

    /// Registers `gauge` as the source of `stat`, replacing the previous one.
    pub fn register_gauge<F>(&self, stat: u64, gauge: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges.retain(|(s, _)| *s != stat);
        gauges.push((stat, Box::new(gauge)));
    }

    /// Pulls every gauge into its slot.
    pub fn refresh(&self) {
        let d = self.start_tm.elapsed().as_millis() as u64;
        self.store(OVERALL_RUN_TIME, d);
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        for (stat, gauge) in gauges.iter() {
            self.store(*stat, gauge());
        }
    }

    pub fn to_json_str(&self) -> String {
        self.refresh();
        let mut grouped = HashMap::new(); // json crate can not stringify FxHashMap.
        for (&group_name, keys) in GROUPS.iter() {
            let mut sub_vals = HashMap::new();
            for key in keys.iter().copied() {
                sub_vals.insert(STATS[&key], self.load(key));
            }
            grouped.insert(group_name, sub_vals);
        }
        json::stringify_pretty(grouped, 4)
    }

    pub fn report_line(&self) -> String {
        self.refresh();
        format!(
            "exec: {} (gen/mut {}/{}), signal max/new {}/{}, corpus: {} (protected {}, prios {})",
            self.load(OVERALL_EXEC_TOTAL),
            self.load(OVERALL_GEN),
            self.load(OVERALL_MUTATION),
            self.load(SIGNAL_MAX),
            self.load(SIGNAL_NEW),
            self.load(CORPUS_LEN),
            self.load(CORPUS_PROTECTED),
            self.load(CORPUS_SUM_PRIOS),
        )
    }
}
