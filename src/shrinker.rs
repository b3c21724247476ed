//! Reclaim participants and the host-side pressure signal
//!
//! Pools stay reclaimable by registering a participant with the host's
//! memory-pressure signal: a `count` inquiry sizing reclaim passes and a
//! `scan` request evicting up to N base pages. The host drives both
//! through [`ShrinkerHost`]; in this crate that host is the embedder (or
//! the test suite) rather than a kernel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// One reclaim request from the host.
#[derive(Clone, Copy, Debug)]
pub struct ShrinkControl {
    /// Base pages the host wants evicted. 0 means "count only".
    pub nr_to_scan: usize,
    /// The triggering allocation may use high memory.
    pub gfp_highmem: bool,
    /// The request comes from the background reclaim daemon, which may
    /// always take high memory.
    pub from_kswapd: bool,
}

impl ShrinkControl {
    pub fn new(nr_to_scan: usize) -> Self {
        Self {
            nr_to_scan,
            gfp_highmem: false,
            from_kswapd: false,
        }
    }

    /// Whether this request may evict high-memory pages.
    pub fn may_take_highmem(&self) -> bool {
        self.from_kswapd || self.gfp_highmem
    }
}

pub type CountFn = Box<dyn Fn(&ShrinkControl) -> Option<usize> + Send + Sync>;
pub type ScanFn = Box<dyn Fn(&ShrinkControl) -> usize + Send + Sync>;

/// A registered reclaim participant.
///
/// `count` returns the participant's reclaimable page count, or `None` as
/// the "empty" sentinel so the host can skip it entirely. `seeks` and
/// `batch` are recorded for the host's pass-sizing policy.
pub struct Shrinker {
    pub name: &'static str,
    pub seeks: u32,
    pub batch: usize,
    count: CountFn,
    scan: ScanFn,
}

impl Shrinker {
    pub fn new(name: &'static str, seeks: u32, batch: usize, count: CountFn, scan: ScanFn) -> Self {
        Self {
            name,
            seeks,
            batch,
            count,
            scan,
        }
    }

    pub fn count(&self, sc: &ShrinkControl) -> Option<usize> {
        (self.count)(sc)
    }

    pub fn scan(&self, sc: &ShrinkControl) -> usize {
        (self.scan)(sc)
    }
}

pub type ShrinkerId = u64;

/// Registration table and driver for the memory-pressure signal.
pub struct ShrinkerHost {
    table: RwLock<HashMap<ShrinkerId, Arc<Shrinker>>>,
    next_id: AtomicU64,
}

impl ShrinkerHost {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, shrinker: Shrinker) -> ShrinkerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("[PagePool] registered reclaim participant '{}'", shrinker.name);
        self.table.write().insert(id, Arc::new(shrinker));
        id
    }

    pub fn unregister(&self, id: ShrinkerId) -> bool {
        self.table.write().remove(&id).is_some()
    }

    pub fn participant_count(&self) -> usize {
        self.table.read().len()
    }

    /// Sum of all participant counts, skipping empty participants.
    pub fn count_all(&self, sc: &ShrinkControl) -> usize {
        let shrinkers: Vec<_> = self.table.read().values().cloned().collect();
        shrinkers.iter().filter_map(|s| s.count(sc)).sum()
    }

    /// Ask participants to evict until `nr_to_scan` pages are freed or
    /// every participant is exhausted. Returns the pages freed.
    pub fn shrink(&self, sc: &ShrinkControl) -> usize {
        if sc.nr_to_scan == 0 {
            return 0;
        }
        let shrinkers: Vec<_> = self.table.read().values().cloned().collect();
        let mut freed = 0;
        for shrinker in shrinkers {
            if freed >= sc.nr_to_scan {
                break;
            }
            if shrinker.count(sc).is_none() {
                continue;
            }
            let sub = ShrinkControl {
                nr_to_scan: sc.nr_to_scan - freed,
                ..*sc
            };
            freed += shrinker.scan(&sub);
        }
        freed
    }
}

impl Default for ShrinkerHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fixed_participant(pages: Arc<AtomicUsize>) -> Shrinker {
        let count_pages = pages.clone();
        Shrinker::new(
            "test-pool",
            1,
            0,
            Box::new(move |_| match count_pages.load(Ordering::SeqCst) {
                0 => None,
                n => Some(n),
            }),
            Box::new(move |sc| {
                let have = pages.load(Ordering::SeqCst);
                let take = have.min(sc.nr_to_scan);
                pages.fetch_sub(take, Ordering::SeqCst);
                take
            }),
        )
    }

    #[test]
    fn test_count_skips_empty_sentinel() {
        let host = ShrinkerHost::new();
        let a = Arc::new(AtomicUsize::new(8));
        let b = Arc::new(AtomicUsize::new(0));
        host.register(fixed_participant(a));
        host.register(fixed_participant(b));

        assert_eq!(host.count_all(&ShrinkControl::new(0)), 8);
    }

    #[test]
    fn test_shrink_stops_when_satisfied() {
        let host = ShrinkerHost::new();
        let a = Arc::new(AtomicUsize::new(10));
        let b = Arc::new(AtomicUsize::new(10));
        host.register(fixed_participant(a.clone()));
        host.register(fixed_participant(b.clone()));

        let freed = host.shrink(&ShrinkControl::new(6));
        assert_eq!(freed, 6);
        let remaining = a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst);
        assert_eq!(remaining, 14, "exactly the requested pages were taken");
    }

    #[test]
    fn test_unregister() {
        let host = ShrinkerHost::new();
        let a = Arc::new(AtomicUsize::new(4));
        let id = host.register(fixed_participant(a));
        assert!(host.unregister(id));
        assert!(!host.unregister(id), "double unregister must report false");
        assert_eq!(host.shrink(&ShrinkControl::new(4)), 0);
    }
}
