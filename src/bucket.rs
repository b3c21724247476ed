//! Buckets: same-class run storage
//!
//! A bucket holds clean runs for one (caching, order, zone) class behind a
//! non-sleeping leaf lock. Every run in a bucket matches the bucket's
//! order and was last configured in the bucket's caching class. The free
//! callback installed at creation knows how to hand a run back to the
//! underlying allocator; it is never invoked with the bucket lock held.

use std::sync::Arc;

use spin::Mutex;

use crate::backend::Zone;
use crate::caching::Caching;
use crate::registry::Registry;
use crate::run::{PageRun, RunList};

/// Releases one run to the underlying allocator, returning the number of
/// base pages freed.
pub type FreeRunFn = Arc<dyn Fn(Box<PageRun>) -> usize + Send + Sync>;

/// A list of clean runs sharing (caching, order, zone).
pub struct Bucket {
    order: usize,
    caching: Caching,
    zone: Zone,
    items: Mutex<RunList>,
    free: FreeRunFn,
    registry: Arc<Registry>,
}

impl Bucket {
    /// Create a bucket and join it to the registry for its lifetime.
    pub fn create(
        registry: &Arc<Registry>,
        order: usize,
        caching: Caching,
        zone: Zone,
        free: FreeRunFn,
    ) -> Arc<Self> {
        let bucket = Arc::new(Self {
            order,
            caching,
            zone,
            items: Mutex::new(RunList::new()),
            free,
            registry: registry.clone(),
        });
        registry.join(bucket.clone());
        bucket
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn caching(&self) -> Caching {
        self.caching
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Pool a clean run. Infallible; the list links through the run itself.
    ///
    /// The caller guarantees the run is clean and configured for this
    /// bucket's caching class. A run of the wrong shape is a programming
    /// error: it is reported and released instead of pooled, because
    /// pooling it would hand a future caller pages in the wrong state.
    pub fn add(&self, run: Box<PageRun>) {
        if run.order() != self.order || run.caching() != self.caching {
            log::error!(
                "[PagePool] run (order {}, {}) does not belong in bucket (order {}, {})",
                run.order(),
                run.caching().label(),
                self.order,
                self.caching.label()
            );
            (self.free)(run);
            return;
        }

        let pages = run.num_pages();
        let mut items = self.items.lock();
        items.push(run);
        self.registry.add_pages(pages);
    }

    /// Take one run out, most recently added first. Empty is not an error.
    pub fn remove(&self) -> Option<Box<PageRun>> {
        let mut items = self.items.lock();
        let run = items.pop()?;
        self.registry.sub_pages(run.num_pages());
        Some(run)
    }

    /// Number of runs currently pooled.
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Remove one run and release it through the free callback. Returns
    /// the number of base pages freed, 0 when the bucket was empty.
    pub(crate) fn free_one(&self) -> usize {
        match self.remove() {
            Some(run) => (self.free)(run),
            None => 0,
        }
    }

    /// Release every pooled run. The lock is dropped across each callback;
    /// the callback may sleep in a DMA unmap or take the registry lock.
    pub fn drain(&self) {
        while let Some(run) = self.remove() {
            (self.free)(run);
        }
    }

    /// Teardown: leave the registry, then release everything.
    pub fn fini(&self) {
        self.registry.leave(self);
        self.drain();
    }
}
