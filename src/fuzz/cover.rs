use crate::signal::{Elem, Prio, Region, Signal};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct CoverInner {
    /// Max signal ever observed, including flakes.
    known: Signal,
    /// Signal found since the last drain, always a subset of `known`.
    pending: Signal,
    /// Events outside of the scope are ignored by `ingest_raw`.
    scope: Region,
}

/// Coverage known to all fuzzers.
#[derive(Debug, Default)]
pub struct Cover {
    inner: RwLock<CoverInner>,
}

impl Cover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(scope: Region) -> Self {
        Self {
            inner: RwLock::new(CoverInner {
                scope,
                ..Default::default()
            }),
        }
    }

    // Nothing panics while holding the lock, recover from poison anyway.
    fn read(&self) -> RwLockReadGuard<'_, CoverInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CoverInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Extends the known signal without reporting it as new.
    pub fn merge_known(&self, s: &Signal) {
        let mut inner = self.write();
        inner.known.merge(s);
    }

    /// Records one raw trace, returns the part of it that is new.
    ///
    /// Events outside of the scope or equal to the sentinel pc are dropped
    /// before comparing with the known signal.
    pub fn ingest_raw(&self, raw: &[Elem], prio: Prio) -> Signal {
        let mut inner = self.write();
        let diff = if inner.scope.is_unrestricted() {
            inner.known.diff_raw(raw, prio)
        } else {
            let scoped = inner.scope.filter(raw);
            inner.known.diff_raw(&scoped, prio)
        };
        if diff.is_empty() {
            return diff;
        }
        inner.known.merge(&diff);
        inner.pending.merge(&diff);
        diff
    }

    /// Copy of the known signal.
    pub fn snapshot(&self) -> Signal {
        let inner = self.read();
        inner.known.clone()
    }

    /// Takes the signal found since the previous drain.
    pub fn drain_delta(&self) -> Signal {
        let mut inner = self.write();
        std::mem::take(&mut inner.pending)
    }

    pub fn known_len(&self) -> usize {
        let inner = self.read();
        inner.known.len()
    }

    pub fn pending_len(&self) -> usize {
        let inner = self.read();
        inner.pending.len()
    }

    pub fn scope(&self) -> Region {
        let inner = self.read();
        inner.scope.clone()
    }

    /// Replaces the scope and returns the old one, later ingestion uses the new one.
    pub fn set_scope(&self, scope: Region) -> Region {
        let new = scope.to_string();
        let old = {
            let mut inner = self.write();
            std::mem::replace(&mut inner.scope, scope)
        };
        log::info!("cover: scope changed {} -> {}", old, new);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AddrRange;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ingest_twice() {
        let cover = Cover::new();
        let trace = [1u64, 2, 3, 3];
        let d = cover.ingest_raw(&trace, 1);
        assert_eq!(d.to_raw(), vec![1, 2, 3]);
        let d = cover.ingest_raw(&trace, 1);
        assert!(d.is_empty());
        assert_eq!(cover.known_len(), 3);
    }

    #[test]
    fn higher_prio_is_new() {
        let cover = Cover::new();
        cover.ingest_raw(&[1, 2], 0);
        let d = cover.ingest_raw(&[1, 2], 1);
        assert_eq!(d.len(), 2);
        let d = cover.ingest_raw(&[1, 2], 0);
        assert!(d.is_empty());
    }

    #[test]
    fn merge_known_is_not_pending() {
        let cover = Cover::new();
        cover.merge_known(&Signal::from_raw(&[5, 6], 1));
        assert_eq!(cover.known_len(), 2);
        assert!(cover.drain_delta().is_empty());
        let d = cover.ingest_raw(&[5, 6, 7], 1);
        assert_eq!(d.to_raw(), vec![7]);
    }

    #[test]
    fn drain_is_union_of_deltas() {
        let cover = Cover::new();
        let mut expected = Signal::new();
        for t in [vec![1u64, 2], vec![2, 3], vec![1, 3], vec![4]].iter() {
            let d = cover.ingest_raw(t, 0);
            expected.merge(&d);
        }
        let drained = cover.drain_delta();
        assert_eq!(drained, expected);
        assert!(cover.drain_delta().is_empty());

        cover.ingest_raw(&[9], 0);
        assert_eq!(cover.drain_delta().to_raw(), vec![9]);
    }

    #[test]
    fn pending_subset_of_known() {
        let cover = Cover::new();
        cover.ingest_raw(&[1, 2, 3], 0);
        cover.drain_delta();
        cover.ingest_raw(&[3, 4, 5], 0);
        let known = cover.snapshot();
        let pending = cover.drain_delta();
        assert!(known.diff(&pending).is_empty());
        assert_eq!(pending.to_raw(), vec![4, 5]);
    }

    #[test]
    fn known_is_monotone() {
        let cover = Cover::new();
        let mut prev = cover.snapshot();
        for i in 0..20u64 {
            cover.ingest_raw(&[i % 7 + 1, i + 100], (i % 3) as u8);
            if i % 5 == 0 {
                cover.drain_delta();
            }
            let now = cover.snapshot();
            assert!(now.diff(&prev).is_empty());
            prev = now;
        }
    }

    #[test]
    fn scope_filters_events() {
        let cover = Cover::with_scope("100-199".parse().unwrap());
        let d = cover.ingest_raw(&[0, 50, 100, 150, 250], 0);
        assert_eq!(d.to_raw(), vec![100, 150]);
        assert!(cover.ingest_raw(&[50, 250], 0).is_empty());

        let old = cover.set_scope(Region::unrestricted());
        assert_eq!(old.to_string(), "0x64-0xc7");
        assert!(cover.scope().is_unrestricted());
        let d = cover.ingest_raw(&[50, 250, 0], 0);
        assert_eq!(d.to_raw(), vec![50, 250]);
    }

    #[test]
    fn set_scope_with_concurrent_ingest() {
        let cover = Arc::new(Cover::new());
        let handles = (0..4u64)
            .map(|t| {
                let cover = Arc::clone(&cover);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let start = 1 + t * 1000 + i;
                        cover.set_scope(Region::with_ranges(vec![
                            AddrRange::new(start, start + 10).unwrap(),
                        ]));
                        cover.ingest_raw(&[start], 0);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        // no guard outlives set_scope.
        assert!(cover.inner.try_write().is_ok());
        assert!(!cover.scope().is_unrestricted());
    }

    #[test]
    fn concurrent_drain_no_loss_no_dup() {
        let cover = Arc::new(Cover::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cover = Arc::clone(&cover);
            handles.push(thread::spawn(move || {
                let mut found = Signal::new();
                for i in 0..500u64 {
                    let pc = 1 + (i * 4 + t) % 1000;
                    found.merge(&cover.ingest_raw(&[pc, pc + 1000], 0));
                }
                found
            }));
        }
        let drainer = {
            let cover = Arc::clone(&cover);
            thread::spawn(move || {
                let mut drains = Vec::new();
                for _ in 0..100 {
                    drains.push(cover.drain_delta());
                    thread::yield_now();
                }
                drains
            })
        };

        let mut all_found = Signal::new();
        for h in handles {
            all_found.merge(&h.join().unwrap());
        }
        let mut drains = drainer.join().unwrap();
        drains.push(cover.drain_delta());

        let mut total = 0;
        let mut all_drained = Signal::new();
        for d in drains.iter() {
            total += d.len();
            all_drained.merge(d);
        }
        assert_eq!(total, all_drained.len());
        assert_eq!(all_drained, all_found);
        assert_eq!(all_drained.len(), cover.known_len());
    }
}
