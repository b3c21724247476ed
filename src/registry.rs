//! Process-wide bucket registry and global accounting
//!
//! Every live bucket joins the registry for its lifetime. Reclaim walks
//! the registry head-first and rotates the reclaimed bucket to the tail,
//! which spreads eviction fairly across all buckets regardless of their
//! caching class or order. A single atomic counter tracks the base pages
//! pooled across all buckets so the reclaim participant's count stays
//! cheap; it is eventually consistent with the per-bucket counts, bounded
//! by the number of in-flight add/remove operations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bucket::Bucket;

pub struct Registry {
    /// Round-robin sequence of all live buckets. Sleeping lock; held
    /// across bucket selection but never across a free callback.
    buckets: Mutex<VecDeque<Arc<Bucket>>>,
    /// Base pages currently pooled across all buckets.
    total_pages: AtomicUsize,
    /// Pool-wide page ceiling enforced after drains. 0 disables the trim.
    max_pooled: AtomicUsize,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(VecDeque::new()),
            total_pages: AtomicUsize::new(0),
            max_pooled: AtomicUsize::new(0),
        })
    }

    pub(crate) fn add_pages(&self, pages: usize) {
        self.total_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_pages(&self, pages: usize) {
        self.total_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    /// Pooled base pages; lock free, eviction-hint accuracy.
    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::Relaxed)
    }

    /// Exact pooled pages, summed bucket by bucket under the registry
    /// lock. Matches [`Self::total_pages`] at any quiescent point.
    pub fn counted_pages(&self) -> usize {
        self.buckets
            .lock()
            .iter()
            .map(|b| b.size() << b.order())
            .sum()
    }

    pub fn set_max_pooled(&self, pages: usize) {
        self.max_pooled.store(pages, Ordering::Relaxed);
    }

    pub fn max_pooled(&self) -> usize {
        self.max_pooled.load(Ordering::Relaxed)
    }

    /// Number of registered buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    pub(crate) fn join(&self, bucket: Arc<Bucket>) {
        self.buckets.lock().push_back(bucket);
    }

    pub(crate) fn leave(&self, bucket: &Bucket) {
        let ptr = bucket as *const Bucket;
        self.buckets.lock().retain(|b| Arc::as_ptr(b) != ptr);
    }

    /// Reclaim one run from the bucket at the head and rotate that bucket
    /// to the tail. Returns the base pages freed (0 if the head bucket was
    /// empty or no bucket is registered).
    ///
    /// The rotation happens under the registry lock, so the selected
    /// bucket cannot be torn down between head-peek and tail-move. The
    /// lock is released before the free callback runs and is not retaken,
    /// letting a concurrent leave make progress.
    pub fn reclaim_one(&self) -> usize {
        let bucket = {
            let mut buckets = self.buckets.lock();
            match buckets.pop_front() {
                Some(b) => {
                    buckets.push_back(b.clone());
                    b
                }
                None => return 0,
            }
        };
        bucket.free_one()
    }

    /// Free up to `nr_to_scan` base pages, one run at a time, rotating the
    /// registry on every step. Stops as soon as the request is satisfied,
    /// the pool is empty, or a full rotation frees nothing (the counter is
    /// only eventually consistent).
    pub fn scan(&self, nr_to_scan: usize) -> usize {
        let mut freed = 0;
        let mut fruitless = 0;
        while freed < nr_to_scan && self.total_pages() > 0 {
            let n = self.reclaim_one();
            if n == 0 {
                fruitless += 1;
                if fruitless > self.len() {
                    break;
                }
            } else {
                fruitless = 0;
                freed += n;
            }
        }
        freed
    }

    /// Synchronously trim the pool back under `max_pooled`. Called after a
    /// successful drain pushed the counter over the limit. Returns the
    /// pages freed.
    pub fn enforce_limit(&self) -> usize {
        let max = self.max_pooled();
        if max == 0 {
            return 0;
        }
        let mut freed = 0;
        let mut fruitless = 0;
        while self.total_pages() > max {
            let n = self.reclaim_one();
            if n == 0 {
                fruitless += 1;
                if fruitless > self.len() {
                    break;
                }
            } else {
                fruitless = 0;
                freed += n;
            }
        }
        if freed > 0 {
            log::debug!("[PagePool] limit trim released {} pages", freed);
        }
        freed
    }
}
