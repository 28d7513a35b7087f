//! Corpus and weighted program selection.
//!
//! Each program is stored with a priority derived from the signal it brought.
//! Selection is weighted by priority through a cumulative sum index, except
//! for programs covering a protected region: every protection rule owns a pool
//! that is sampled with a fixed probability, so that a small group of valuable
//! programs is not diluted by a growing corpus.

use crate::signal::{Region, Signal};
use rand::{seq::SliceRandom, Rng};
use std::{
    mem,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub type CorpusId = usize;
/// Bit `i` is set if the program belongs to the pool of rule `i`.
pub type PoolMask = u64;

pub const MAX_PROTECT_RULES: usize = PoolMask::BITS as usize;
pub const DEFAULT_PROTECT_PROB: f64 = 0.5;

/// Programs whose signal touches `region` are selected with probability `prob`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectRule {
    pub name: String,
    pub region: Region,
    pub prob: f64,
}

impl ProtectRule {
    pub fn new<T: Into<String>>(name: T, region: Region, prob: f64) -> Self {
        Self {
            name: name.into(),
            region,
            prob,
        }
    }

    fn clamp_prob(&mut self) {
        self.prob = clamped(self.prob);
    }
}

#[inline]
fn clamped(prob: f64) -> f64 {
    if prob.is_nan() {
        0.0
    } else {
        prob.max(0.0).min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgInfo<P> {
    pub id: CorpusId,
    pub prog: P,
    pub prio: u64,
    /// Sum of the prio of this program and all programs before it.
    pub acc: u64,
    pub pools: PoolMask,
}

#[derive(Debug, Clone)]
pub struct Corpus<P> {
    progs: Vec<ProgInfo<P>>,
    /// Indexes into `progs`, one list per protection rule.
    pools: Vec<Vec<usize>>,
    sum_prios: u64,
    next_id: CorpusId,
}

impl<P> Default for Corpus<P> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<P> Corpus<P> {
    pub fn new(pool_num: usize) -> Self {
        Self {
            progs: Vec::new(),
            pools: vec![Vec::new(); pool_num],
            sum_prios: 0,
            next_id: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.progs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.progs.is_empty()
    }

    #[inline]
    pub fn sum_prios(&self) -> u64 {
        self.sum_prios
    }

    pub fn progs(&self) -> &[ProgInfo<P>] {
        &self.progs
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> + '_ {
        self.progs.iter().map(|p| &p.prog)
    }

    pub fn pool_num(&self) -> usize {
        self.pools.len()
    }

    pub fn pool(&self, rule: usize) -> &[usize] {
        self.pools.get(rule).map(|p| &p[..]).unwrap_or(&[])
    }

    /// Ids grow with insertion order, so lookup is a binary search.
    pub fn get(&self, id: CorpusId) -> Option<&P> {
        let idx = self.progs.binary_search_by_key(&id, |p| p.id).ok()?;
        Some(&self.progs[idx].prog)
    }

    fn next_id(&mut self) -> CorpusId {
        let ret = self.next_id;
        self.next_id += 1;
        ret
    }

    /// Appends `prog`, a zero prio is raised to 1 so the program stays selectable.
    pub fn add_prog(&mut self, prog: P, prio: u64, pools: PoolMask) -> CorpusId {
        let id = self.next_id();
        self.add_prog_with_id(id, prog, prio, pools);
        id
    }

    fn add_prog_with_id(&mut self, id: CorpusId, prog: P, prio: u64, pools: PoolMask) {
        let prio = prio.max(1);
        self.sum_prios += prio;
        let idx = self.progs.len();
        self.progs.push(ProgInfo {
            id,
            prog,
            prio,
            acc: self.sum_prios,
            pools,
        });
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if pools & (1 << i) != 0 {
                pool.push(idx);
            }
        }
    }

    /// Selects by the protection rules first, then by prio.
    ///
    /// Rule `i` biases pool `i`, rules without a pool are ignored.
    pub(crate) fn select<R: Rng + ?Sized>(&self, rules: &[ProtectRule], rng: &mut R) -> Option<&P> {
        if self.is_empty() {
            return None;
        }
        debug_assert!(rules.len() <= self.pools.len());
        for (rule, pool) in rules.iter().zip(self.pools.iter()) {
            if !pool.is_empty() && rng.gen_bool(clamped(rule.prob)) {
                if let Some(&idx) = pool.choose(rng) {
                    return Some(&self.progs[idx].prog);
                }
            }
        }
        self.select_weighted(rng)
    }

    /// Selects by prio only, a program is chosen with probability `prio / sum_prios`.
    pub fn select_weighted<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&P> {
        if self.is_empty() {
            return None;
        }
        let n = rng.gen_range(0..self.sum_prios);
        let idx = match self.progs.binary_search_by_key(&n, |p| p.acc) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        Some(&self.progs[idx].prog)
    }

    /// Rebuilds the corpus after `update` adjusted each entry, entries with zero prio are dropped.
    pub fn culling<F>(&mut self, mut update: F) -> usize
    where
        F: FnMut(&mut ProgInfo<P>),
    {
        let mut new_corpus = Corpus {
            progs: Vec::with_capacity(self.len()),
            pools: vec![Vec::new(); self.pools.len()],
            sum_prios: 0,
            next_id: self.next_id, // keep the old id count
        };
        let progs = mem::take(&mut self.progs);
        for mut p in progs {
            update(&mut p);
            if p.prio != 0 {
                new_corpus.add_prog_with_id(p.id, p.prog, p.prio, p.pools);
            }
        }
        *self = new_corpus;
        self.len()
    }

    fn fit_pools(&mut self, pool_num: usize) {
        self.pools.resize_with(pool_num, Vec::new);
    }

    /// Checks that the cumulative index matches the prios.
    pub fn is_consistent(&self) -> bool {
        let mut acc = 0;
        for p in self.progs.iter() {
            if p.prio == 0 {
                return false;
            }
            acc += p.prio;
            if p.acc != acc {
                return false;
            }
        }
        acc == self.sum_prios
            && self
                .pools
                .iter()
                .all(|pool| pool.iter().all(|&idx| idx < self.progs.len()))
    }
}

/// Shared corpus, selection only takes the read lock.
#[derive(Debug)]
pub struct Scheduler<P> {
    inner: RwLock<Arc<Corpus<P>>>,
    rules: Arc<[ProtectRule]>,
}

impl<P: Clone> Default for Scheduler<P> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<P: Clone> Scheduler<P> {
    pub fn new(mut rules: Vec<ProtectRule>) -> Self {
        if rules.len() > MAX_PROTECT_RULES {
            log::warn!(
                "corpus: too many protect rules ({}), only the first {} are used",
                rules.len(),
                MAX_PROTECT_RULES
            );
            rules.truncate(MAX_PROTECT_RULES);
        }
        rules.iter_mut().for_each(ProtectRule::clamp_prob);
        let corpus = Corpus::new(rules.len());
        Self {
            inner: RwLock::new(Arc::new(corpus)),
            rules: rules.into(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Corpus<P>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Corpus<P>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rules(&self) -> &[ProtectRule] {
        &self.rules
    }

    pub fn classify(&self, s: &Signal) -> PoolMask {
        let mut mask = 0;
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.region.intersects(s) {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Adds `prog` with prio `max(1, |s|)`.
    pub fn admit(&self, prog: P, s: &Signal) -> CorpusId {
        let prio = (s.len() as u64).max(1);
        let pools = self.classify(s);
        let id = {
            let mut inner = self.write();
            Arc::make_mut(&mut *inner).add_prog(prog, prio, pools)
        };
        if pools != 0 {
            for (i, rule) in self.rules.iter().enumerate() {
                if pools & (1 << i) != 0 {
                    log::info!("corpus: {} prog found, id: {}, prio: {}", rule.name, id, prio);
                }
            }
        }
        id
    }

    /// Chooses a program to mutate, `None` if the corpus is empty.
    pub fn select_one<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<P> {
        let inner = self.read();
        inner.select(&self.rules, rng).cloned()
    }

    /// Current corpus. Programs admitted later do not show up in the returned value.
    ///
    /// The next write clones the whole corpus while a snapshot is alive, so
    /// drop snapshots once done with them.
    pub fn snapshot(&self) -> Arc<Corpus<P>> {
        let inner = self.read();
        Arc::clone(&inner)
    }

    /// Builds a classified corpus, e.g. from the result of minimization.
    pub fn rebuild<I>(&self, progs: I) -> Corpus<P>
    where
        I: IntoIterator<Item = (P, Signal)>,
    {
        let mut corpus = Corpus::new(self.rules.len());
        for (p, s) in progs {
            let prio = (s.len() as u64).max(1);
            corpus.add_prog(p, prio, self.classify(&s));
        }
        corpus
    }

    /// Swaps in `other` as a whole, protected pools are taken from `other`.
    pub fn replace_all(&self, mut other: Corpus<P>) {
        other.fit_pools(self.rules.len());
        let (old_len, new_len) = (self.len(), other.len());
        let old = {
            let mut inner = self.write();
            mem::replace(&mut *inner, Arc::new(other))
        };
        drop(old);
        log::info!("corpus: replaced, len: {} -> {}", old_len, new_len);
    }

    /// Re-prioritizes programs in place, returns the new length.
    pub fn culling<F>(&self, f: F) -> usize
    where
        F: FnMut(&mut ProgInfo<P>),
    {
        let mut inner = self.write();
        Arc::make_mut(&mut *inner).culling(f)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn sum_prios(&self) -> u64 {
        self.read().sum_prios()
    }

    pub fn protected_len(&self, rule: usize) -> usize {
        self.read().pool(rule).len()
    }
}
