//! Dynamic pool: deferred zeroing off the fast path
//!
//! A dynamic pool keeps a single order of runs and guarantees that pooled
//! runs handed back out are zeroed. Returned runs land on a dirty-deferred
//! sub-list (split low/high memory) and a per-pool worker thread zeroes
//! them in bounded batches before moving them to the clean side. The pool
//! lock is released across the zeroing step so the worker cannot form a
//! lock cycle with the reclaim participant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::backend::{AllocFlags, PageAdapter};
use crate::caching::Caching;
use crate::manager::PoolManager;
use crate::pool::AllocContext;
use crate::run::{PageRef, PageRun, RunList};
use crate::shrinker::ShrinkControl;
use crate::PoolError;

// ============================================================================
// Sub-lists
// ============================================================================

const CLEAN_LOW: usize = 0;
const CLEAN_HIGH: usize = 1;
const DEFERRED_LOW: usize = 2;
const DEFERRED_HIGH: usize = 3;
const NUM_SUBLISTS: usize = 4;

/// Run counts per sub-list, for stats and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DynCounts {
    pub clean_low: usize,
    pub clean_high: usize,
    pub deferred_low: usize,
    pub deferred_high: usize,
}

impl DynCounts {
    pub fn deferred(&self) -> usize {
        self.deferred_low + self.deferred_high
    }

    pub fn clean(&self) -> usize {
        self.clean_low + self.clean_high
    }
}

struct SubLists {
    lists: [RunList; NUM_SUBLISTS],
}

impl SubLists {
    fn new() -> Self {
        Self {
            lists: [RunList::new(), RunList::new(), RunList::new(), RunList::new()],
        }
    }

    fn deferred_runs(&self) -> usize {
        self.lists[DEFERRED_LOW].len() + self.lists[DEFERRED_HIGH].len()
    }

    fn counts(&self) -> DynCounts {
        DynCounts {
            clean_low: self.lists[CLEAN_LOW].len(),
            clean_high: self.lists[CLEAN_HIGH].len(),
            deferred_low: self.lists[DEFERRED_LOW].len(),
            deferred_high: self.lists[DEFERRED_HIGH].len(),
        }
    }
}

// ============================================================================
// Shared pool state and the cleaning worker
// ============================================================================

pub(crate) struct DynShared {
    order: usize,
    gfp: AllocFlags,
    adapter: Arc<PageAdapter>,
    lists: Mutex<SubLists>,
    /// Worker waitqueue over the deferred count.
    waitq: Condvar,
    shutdown: AtomicBool,
    batch: usize,
    passes: usize,
}

impl DynShared {
    /// Take a clean run, high memory preferred.
    fn fetch(&self) -> Option<Box<PageRun>> {
        let mut lists = self.lists.lock();
        if let Some(run) = lists.lists[CLEAN_HIGH].pop() {
            return Some(run);
        }
        lists.lists[CLEAN_LOW].pop()
    }

    fn add_deferred(&self, run: Box<PageRun>) {
        let index = if run.is_highmem() { DEFERRED_HIGH } else { DEFERRED_LOW };
        self.lists.lock().lists[index].push(run);
        self.waitq.notify_one();
    }

    fn add_clean(&self, lists: &mut MutexGuard<'_, SubLists>, run: Box<PageRun>) {
        let index = if run.is_highmem() { CLEAN_HIGH } else { CLEAN_LOW };
        lists.lists[index].push(run);
    }

    /// Pooled pages, counting high memory only when the caller may use it.
    fn total_pages(&self, high: bool) -> usize {
        let counts = self.lists.lock().counts();
        let mut runs = counts.clean_low + counts.deferred_low;
        if high {
            runs += counts.clean_high + counts.deferred_high;
        }
        runs << self.order
    }

    /// One bounded cleaning cycle: up to `passes` batches of at most
    /// `batch` runs each, dirtiest list first.
    fn clean_cycle(&self) {
        for _ in 0..self.passes {
            let batch: Vec<Box<PageRun>> = {
                let mut lists = self.lists.lock();
                let index = if !lists.lists[DEFERRED_HIGH].is_empty() {
                    DEFERRED_HIGH
                } else if !lists.lists[DEFERRED_LOW].is_empty() {
                    DEFERRED_LOW
                } else {
                    break;
                };
                let take = self.batch.min(lists.lists[index].len());
                (0..take)
                    .filter_map(|_| lists.lists[index].pop())
                    .collect()
            };

            // The pool lock is dropped here: zeroing maps and touches
            // every page and must not hold the lock the reclaim side
            // takes.
            let pages: Vec<PageRef> = batch.iter().flat_map(|run| run.pages()).collect();
            if self.adapter.backend().zero_mapped(&pages) {
                let mut lists = self.lists.lock();
                for run in batch {
                    self.add_clean(&mut lists, run);
                }
            } else {
                log::error!("[PoolClean] mapping for zeroing failed, releasing {} runs", batch.len());
                for run in batch {
                    self.adapter.free_run(run);
                }
            }
        }
    }

    /// Evict up to `nr_to_scan` base pages. Un-zeroed pages go first (they
    /// are discardable without any cleaning work), low memory before high.
    fn do_shrink(&self, nr_to_scan: usize, high: bool) -> usize {
        let mut freed = 0;
        while freed < nr_to_scan {
            let run = {
                let mut lists = self.lists.lock();
                if let Some(run) = lists.lists[DEFERRED_LOW].pop() {
                    Some(run)
                } else if high && !lists.lists[DEFERRED_HIGH].is_empty() {
                    lists.lists[DEFERRED_HIGH].pop()
                } else if let Some(run) = lists.lists[CLEAN_LOW].pop() {
                    Some(run)
                } else if high {
                    lists.lists[CLEAN_HIGH].pop()
                } else {
                    None
                }
            };
            match run {
                Some(run) => freed += self.adapter.free_run(run),
                None => break,
            }
        }
        freed
    }
}

fn worker_loop(shared: Arc<DynShared>) {
    log::debug!("[PoolClean] worker started");
    loop {
        {
            let mut lists = shared.lists.lock();
            while !shared.shutdown.load(Ordering::Relaxed) && lists.deferred_runs() == 0 {
                shared.waitq.wait(&mut lists);
            }
        }
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        shared.clean_cycle();
    }
    log::debug!("[PoolClean] worker stopped");
}

// ============================================================================
// Pool registry
// ============================================================================

/// Registry of dynamic pools for the reclaim participant.
pub struct DynRegistry {
    pools: Mutex<Vec<Arc<DynShared>>>,
}

impl DynRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(Vec::new()),
        })
    }

    fn join(&self, pool: Arc<DynShared>) {
        self.pools.lock().push(pool);
    }

    fn leave(&self, pool: &Arc<DynShared>) {
        self.pools.lock().retain(|p| !Arc::ptr_eq(p, pool));
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Reclaimable pages across all dynamic pools.
    pub fn count(&self, sc: &ShrinkControl) -> usize {
        let pools: Vec<_> = self.pools.lock().clone();
        pools
            .iter()
            .map(|p| p.total_pages(sc.may_take_highmem()))
            .sum()
    }

    /// Walk the pools until the request is satisfied.
    pub fn shrink(&self, sc: &ShrinkControl) -> usize {
        let pools: Vec<_> = self.pools.lock().clone();
        let high = sc.may_take_highmem();
        let mut freed = 0;
        for pool in pools {
            if freed >= sc.nr_to_scan {
                break;
            }
            freed += pool.do_shrink(sc.nr_to_scan - freed, high);
        }
        freed
    }
}

// ============================================================================
// Public pool type
// ============================================================================

/// Single-order pool with deferred zeroing.
///
/// `alloc` hands out zeroed runs: clean pooled runs first, then a
/// synchronous cleaning pass over the deferred lists, then the allocator
/// (with zeroing requested). `free` never blocks on cleaning; it deposits
/// the run on the deferred side and wakes the worker.
pub struct DynamicPool {
    shared: Arc<DynShared>,
    registry: Arc<DynRegistry>,
    worker: Option<JoinHandle<()>>,
}

impl DynamicPool {
    /// Create the pool and start its worker. Worker start is part of
    /// construction: a spawn failure rolls everything back and nothing is
    /// registered.
    pub fn new(mgr: &PoolManager, order: usize, gfp: AllocFlags) -> Result<Self, PoolError> {
        let shared = Arc::new(DynShared {
            order,
            gfp,
            adapter: Arc::new(PageAdapter::new(mgr.backend().clone(), None, false)),
            lists: Mutex::new(SubLists::new()),
            waitq: Condvar::new(),
            shutdown: AtomicBool::new(false),
            batch: mgr.clean_batch(),
            passes: mgr.clean_passes(),
        });

        let worker = thread::Builder::new()
            .name("pool-cleaner".to_string())
            .spawn({
                let shared = shared.clone();
                move || worker_loop(shared)
            })?;

        let registry = mgr.dyn_pools().clone();
        registry.join(shared.clone());

        Ok(Self {
            shared,
            registry,
            worker: Some(worker),
        })
    }

    pub fn order(&self) -> usize {
        self.shared.order
    }

    /// Take one zeroed run.
    pub fn alloc(&self, ctx: &AllocContext) -> Option<Box<PageRun>> {
        if let Some(run) = self.shared.fetch() {
            return Some(run);
        }

        // Nothing clean; try to promote deferred pages synchronously.
        self.shared.clean_cycle();
        if let Some(run) = self.shared.fetch() {
            return Some(run);
        }

        if ctx.cancelled() {
            return None;
        }
        self.shared.adapter.alloc_run(
            self.shared.order,
            Caching::Cached,
            self.shared.gfp.with(AllocFlags::ZERO),
        )
    }

    /// Return a run. The pages are treated as dirty; the worker zeroes
    /// them before they can be handed out again.
    pub fn free(&self, run: Box<PageRun>) {
        if run.order() != self.shared.order {
            log::error!(
                "[PagePool] run of order {} returned to dynamic pool of order {}",
                run.order(),
                self.shared.order
            );
            self.shared.adapter.free_run(run);
            return;
        }
        self.shared.add_deferred(run);
    }

    pub fn counts(&self) -> DynCounts {
        self.shared.lists.lock().counts()
    }

    /// Pooled pages visible to a reclaim request of the given kind.
    pub fn total_pages(&self, high: bool) -> usize {
        self.shared.total_pages(high)
    }
}

impl Drop for DynamicPool {
    fn drop(&mut self) {
        self.registry.leave(&self.shared);

        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.waitq.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let mut lists = self.shared.lists.lock();
        for index in 0..NUM_SUBLISTS {
            while let Some(run) = lists.lists[index].pop() {
                self.shared.adapter.free_run(run);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{PoolConfig, PoolManager};
    use crate::mock::MockBackend;
    use crate::PAGE_SIZE;
    use std::time::{Duration, Instant};

    fn mock_manager() -> (Arc<MockBackend>, PoolManager) {
        let backend = MockBackend::shared();
        let config = PoolConfig {
            backend: backend.clone(),
            ..PoolConfig::default()
        };
        (backend, PoolManager::new(config))
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for worker");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_create_and_drop_joins_worker() {
        let (_backend, mgr) = mock_manager();
        let pool = DynamicPool::new(&mgr, 0, AllocFlags::NONE).unwrap();
        assert_eq!(mgr.dyn_pools().pool_count(), 1);
        drop(pool);
        assert_eq!(mgr.dyn_pools().pool_count(), 0);
    }

    #[test]
    fn test_freed_runs_are_zeroed_and_reused() {
        let (backend, mgr) = mock_manager();
        let pool = DynamicPool::new(&mgr, 1, AllocFlags::NONE).unwrap();

        let run = pool.alloc(&AllocContext::default()).unwrap();
        unsafe { core::ptr::write_bytes(run.base().as_ptr(), 0xAB, PAGE_SIZE * 2) };
        pool.free(run);

        wait_until(|| pool.counts().deferred() == 0 && pool.counts().clean() == 1);

        let attempts_before = backend.total_alloc_attempts();
        let run = pool.alloc(&AllocContext::default()).unwrap();
        assert_eq!(backend.total_alloc_attempts(), attempts_before, "reuse must not allocate");

        let bytes = unsafe { core::slice::from_raw_parts(run.base().as_ptr(), PAGE_SIZE * 2) };
        assert!(bytes.iter().all(|&b| b == 0), "reused run must read as zeros");
        pool.free(run);
    }

    #[test]
    fn test_alloc_promotes_deferred_synchronously() {
        let (_backend, mgr) = mock_manager();
        let pool = DynamicPool::new(&mgr, 0, AllocFlags::NONE).unwrap();

        let run = pool.alloc(&AllocContext::default()).unwrap();
        pool.free(run);

        // Whether the worker or the sync path cleans it, alloc must get a
        // zeroed run back without leaving anything deferred.
        let run = pool.alloc(&AllocContext::default()).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(run.base().as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.free(run);
    }

    #[test]
    fn test_order_mismatch_is_released() {
        let (backend, mgr) = mock_manager();
        let pool = DynamicPool::new(&mgr, 2, AllocFlags::NONE).unwrap();

        let adapter = PageAdapter::new(backend.clone(), None, false);
        let stray = adapter.alloc_run(0, Caching::Cached, AllocFlags::NONE).unwrap();
        pool.free(stray);

        assert_eq!(pool.counts(), DynCounts::default(), "mismatched run must not be pooled");
        assert_eq!(backend.outstanding(), 0);
    }

    /// Builds the shared state directly, with no worker, so list contents
    /// stay exactly where the test puts them.
    fn bare_shared(backend: Arc<MockBackend>, order: usize) -> Arc<DynShared> {
        Arc::new(DynShared {
            order,
            gfp: AllocFlags::NONE,
            adapter: Arc::new(PageAdapter::new(backend, None, false)),
            lists: Mutex::new(SubLists::new()),
            waitq: Condvar::new(),
            shutdown: AtomicBool::new(false),
            batch: 32,
            passes: 4,
        })
    }

    #[test]
    fn test_shrink_prefers_deferred_pages() {
        let backend = MockBackend::shared();
        let shared = bare_shared(backend.clone(), 0);

        {
            let mut lists = shared.lists.lock();
            for _ in 0..2 {
                let run = shared.adapter.alloc_run(0, Caching::Cached, AllocFlags::NONE).unwrap();
                lists.lists[CLEAN_LOW].push(run);
            }
            for _ in 0..2 {
                let run = shared.adapter.alloc_run(0, Caching::Cached, AllocFlags::NONE).unwrap();
                lists.lists[DEFERRED_LOW].push(run);
            }
        }

        assert_eq!(shared.do_shrink(2, false), 2);
        let counts = shared.lists.lock().counts();
        assert_eq!(counts.deferred_low, 0, "deferred pages are discardable and must go first");
        assert_eq!(counts.clean_low, 2, "clean inventory survives");

        assert_eq!(shared.do_shrink(8, false), 2, "shrink stops when the pool is empty");
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_shrink_without_highmem_leaves_high_pages() {
        let backend = MockBackend::shared();
        let shared = bare_shared(backend.clone(), 0);

        backend.set_highmem_allocs(true);
        {
            let mut lists = shared.lists.lock();
            let run = shared.adapter.alloc_run(0, Caching::Cached, AllocFlags::HIGHMEM).unwrap();
            lists.lists[DEFERRED_HIGH].push(run);
        }

        assert_eq!(shared.do_shrink(4, false), 0, "high pages need a highmem-capable request");
        assert_eq!(shared.do_shrink(4, true), 1);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_highmem_split() {
        let (backend, mgr) = mock_manager();
        let pool = DynamicPool::new(&mgr, 0, AllocFlags::HIGHMEM).unwrap();

        backend.set_highmem_allocs(true);
        let run = pool.alloc(&AllocContext::default()).unwrap();
        assert!(run.is_highmem());
        pool.free(run);
        wait_until(|| pool.counts().clean_high == 1);

        // A reclaim request that may not take high memory sees nothing.
        assert_eq!(pool.total_pages(false), 0);
        assert_eq!(pool.total_pages(true), 1);
    }
}
