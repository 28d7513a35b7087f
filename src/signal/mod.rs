//! Coverage signal.
//!
//! A signal is a set of coverage events (usually kernel PCs), each tagged with
//! the priority of the observation that produced it. Higher priority means the
//! event was observed in a more trusted run, e.g. a run without collisions.

use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;

pub mod region;

pub use region::{AddrRange, Region, RegionError};

/// Identifier of one coverage event.
pub type Elem = u64;
/// Priority of an observation.
pub type Prio = u8;

/// Sentinel pc that never denotes a real coverage event.
pub const INVALID_ELEM: Elem = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signal {
    elems: FxHashMap<Elem, Prio>,
}

impl Signal {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds signal from a raw trace, all events share the same `prio`.
    pub fn from_raw(raw: &[Elem], prio: Prio) -> Self {
        let mut elems = FxHashMap::default();
        elems.reserve(raw.len());
        for &e in raw.iter().filter(|&&e| e != INVALID_ELEM) {
            elems.insert(e, prio);
        }
        Self { elems }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    #[inline]
    pub fn contains(&self, e: Elem) -> bool {
        self.elems.contains_key(&e)
    }

    #[inline]
    pub fn prio_of(&self, e: Elem) -> Option<Prio> {
        self.elems.get(&e).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Elem, Prio)> + '_ {
        self.elems.iter().map(|(&e, &p)| (e, p))
    }

    pub fn elems(&self) -> impl Iterator<Item = Elem> + '_ {
        self.elems.keys().copied()
    }

    /// Union with `other`, the higher priority wins on conflict.
    pub fn merge(&mut self, other: &Signal) {
        if self.elems.is_empty() {
            self.elems = other.elems.clone();
            return;
        }
        self.elems.reserve(other.len());
        for (&e, &p) in other.elems.iter() {
            self.merge_one(e, p);
        }
    }

    fn merge_one(&mut self, e: Elem, p: Prio) {
        match self.elems.entry(e) {
            Entry::Occupied(mut o) => {
                if *o.get() < p {
                    o.insert(p);
                }
            }
            Entry::Vacant(v) => {
                v.insert(p);
            }
        }
    }

    /// Events of `raw` that are unknown to `self`, or known only with a lower priority.
    pub fn diff_raw(&self, raw: &[Elem], prio: Prio) -> Signal {
        let mut ret = Signal::new();
        for &e in raw.iter().filter(|&&e| e != INVALID_ELEM) {
            match self.elems.get(&e) {
                Some(&p) if p >= prio => continue,
                _ => {
                    ret.elems.insert(e, prio);
                }
            }
        }
        ret
    }

    /// Events of `other` that are unknown to `self`, or known only with a lower priority.
    pub fn diff(&self, other: &Signal) -> Signal {
        let mut ret = Signal::new();
        for (&e, &p) in other.elems.iter() {
            match self.elems.get(&e) {
                Some(&p0) if p0 >= p => continue,
                _ => {
                    ret.elems.insert(e, p);
                }
            }
        }
        ret
    }

    /// Events present in both, with the lower of the two priorities.
    pub fn intersection(&self, other: &Signal) -> Signal {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut ret = Signal::new();
        for (&e, &p) in small.elems.iter() {
            if let Some(&p1) = large.elems.get(&e) {
                ret.elems.insert(e, p.min(p1));
            }
        }
        ret
    }

    /// Moves at most `n` events out of `self`.
    pub fn split(&mut self, n: usize) -> Signal {
        if n >= self.len() {
            return std::mem::take(self);
        }
        let taken = self.elems.keys().take(n).copied().collect::<Vec<_>>();
        let mut ret = Signal::new();
        for e in taken {
            if let Some(p) = self.elems.remove(&e) {
                ret.elems.insert(e, p);
            }
        }
        ret
    }

    /// Sorted events without priorities.
    pub fn to_raw(&self) -> Vec<Elem> {
        let mut raw = self.elems.keys().copied().collect::<Vec<_>>();
        raw.sort_unstable();
        raw
    }
}

impl Extend<(Elem, Prio)> for Signal {
    fn extend<T: IntoIterator<Item = (Elem, Prio)>>(&mut self, iter: T) {
        for (e, p) in iter {
            if e != INVALID_ELEM {
                self.merge_one(e, p);
            }
        }
    }
}

impl std::iter::FromIterator<(Elem, Prio)> for Signal {
    fn from_iter<T: IntoIterator<Item = (Elem, Prio)>>(iter: T) -> Self {
        let mut s = Signal::new();
        s.extend(iter);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_drops_sentinel_and_dups() {
        let s = Signal::from_raw(&[1, 2, 2, 0, 3], 1);
        assert_eq!(s.len(), 3);
        assert!(!s.contains(INVALID_ELEM));
        assert_eq!(s.to_raw(), vec![1, 2, 3]);
    }

    #[test]
    fn merge_keeps_higher_prio() {
        let mut a = Signal::from_raw(&[1, 2], 1);
        let b = Signal::from_raw(&[2, 3], 3);
        a.merge(&b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.prio_of(1), Some(1));
        assert_eq!(a.prio_of(2), Some(3));

        let mut c = Signal::from_raw(&[2], 0);
        c.merge(&a);
        assert_eq!(c.prio_of(2), Some(3));
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let a = Signal::from_raw(&[1, 2, 5], 2);
        let b: Signal = vec![(2, 1), (7, 4)].into_iter().collect();

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let before = ab.clone();
        ab.merge(&b);
        assert_eq!(ab, before);
    }

    #[test]
    fn diff_raw_respects_prio() {
        let known = Signal::from_raw(&[10, 11], 1);
        let snapshot = known.clone();

        let d = known.diff_raw(&[10, 11, 12], 1);
        assert_eq!(d.to_raw(), vec![12]);

        let d = known.diff_raw(&[10, 12], 2);
        assert_eq!(d.to_raw(), vec![10, 12]);
        assert_eq!(d.prio_of(10), Some(2));

        let d = known.diff_raw(&[10, 11], 0);
        assert!(d.is_empty());
        assert_eq!(known, snapshot);
    }

    #[test]
    fn intersection_and_diff() {
        let a = Signal::from_raw(&[1, 2, 3], 2);
        let b = Signal::from_raw(&[2, 3, 4], 1);
        let i = a.intersection(&b);
        assert_eq!(i.to_raw(), vec![2, 3]);
        assert_eq!(i.prio_of(2), Some(1));
        assert_eq!(a.diff(&b).to_raw(), vec![4]);
        // 2 and 3 are held by `b` with a lower prio.
        let d = b.diff(&a);
        assert_eq!(d.to_raw(), vec![1, 2, 3]);
        assert_eq!(d.prio_of(2), Some(2));
    }

    #[test]
    fn diff_same_prio_is_set_difference() {
        let a = Signal::from_raw(&[1, 2, 3], 1);
        let b = Signal::from_raw(&[2, 3, 4], 1);
        assert_eq!(a.diff(&b).to_raw(), vec![4]);
        assert_eq!(b.diff(&a).to_raw(), vec![1]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn split_moves_elems() {
        let mut s = Signal::from_raw(&[1, 2, 3, 4, 5], 0);
        let part = s.split(2);
        assert_eq!(part.len(), 2);
        assert_eq!(s.len(), 3);
        assert!(part.intersection(&s).is_empty());
        let rest = s.split(10);
        assert_eq!(rest.len(), 3);
        assert!(s.is_empty());
    }
}
