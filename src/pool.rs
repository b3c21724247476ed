//! Pool facade: populate and drain over a caller page array
//!
//! A pool serves page requests from its buckets before falling back to the
//! allocator adapter, largest fitting order first. Pools created for
//! coherent DMA own a full (caching x order) bucket grid; all other pools
//! share the four process-wide bucket arrays through the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{AllocFlags, Device, PageAdapter, Zone};
use crate::bucket::Bucket;
use crate::caching::{Caching, CachingStage, NUM_CACHING_TYPES};
use crate::manager::PoolManager;
use crate::registry::Registry;
use crate::run::{DmaAddr, PageRef, PageRun};
use crate::{PoolError, MAX_ORDER};

/// The caller-owned page array a pool fills and later drains: page
/// handles, optionally per-page DMA addresses, and the caching class the
/// pages are configured for.
pub struct PageAllocation {
    num_pages: usize,
    caching: Caching,
    zero: bool,
    pages: Vec<PageRef>,
    dma_addrs: Option<Vec<DmaAddr>>,
}

impl PageAllocation {
    pub fn new(num_pages: usize, caching: Caching) -> Self {
        Self {
            num_pages,
            caching,
            zero: false,
            pages: Vec::new(),
            dma_addrs: None,
        }
    }

    /// Request per-page DMA addresses alongside the pages.
    pub fn with_dma(mut self) -> Self {
        self.dma_addrs = Some(Vec::new());
        self
    }

    /// Request zero-initialized memory for fresh allocations.
    pub fn with_zero(mut self) -> Self {
        self.zero = true;
        self
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn caching(&self) -> Caching {
        self.caching
    }

    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    pub fn dma_addrs(&self) -> Option<&[DmaAddr]> {
        self.dma_addrs.as_deref()
    }

    pub fn is_populated(&self) -> bool {
        !self.pages.is_empty()
    }
}

/// Per-request options for populate.
#[derive(Clone, Default)]
pub struct AllocContext {
    /// The caller would rather see a failure than heavy reclaim retries.
    pub gfp_retry_mayfail: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl AllocContext {
    /// A context that aborts populate when `token` becomes true; the
    /// fatal-signal analog. The check happens before every allocator call
    /// and everything already acquired is rolled back.
    pub fn interruptible(token: Arc<AtomicBool>) -> Self {
        Self {
            gfp_retry_mayfail: false,
            cancel: Some(token),
        }
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |t| t.load(Ordering::Relaxed))
    }
}

/// Construction options for a pool.
#[derive(Default)]
pub struct PoolOptions {
    /// Device for DMA allocations and mappings.
    pub dev: Option<Arc<Device>>,
    /// Allocate through the coherent DMA allocator; gives the pool its own
    /// bucket grid.
    pub use_dma_alloc: bool,
    /// Constrain allocations to 32-bit addressable memory.
    pub use_dma32: bool,
}

/// Counters for one pool.
#[derive(Default)]
struct PoolStats {
    populations: AtomicU64,
    drains: AtomicU64,
    pool_hits: AtomicU64,
    fresh_allocs: AtomicU64,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStatsSnapshot {
    pub populations: u64,
    pub drains: u64,
    pub pool_hits: u64,
    pub fresh_allocs: u64,
}

type BucketGrid = [[Arc<Bucket>; MAX_ORDER]; NUM_CACHING_TYPES];

/// One run handed to the caller, tracked until populate commits or rolls
/// back.
struct StagedRun {
    run: Box<PageRun>,
    /// The bucket the run came out of; `None` for a fresh allocation.
    origin: Option<Arc<Bucket>>,
    /// Run-level DMA address when the caller asked for mappings.
    mapped: Option<DmaAddr>,
}

/// Per-owner pool of page runs.
pub struct Pool {
    adapter: Arc<PageAdapter>,
    registry: Arc<Registry>,
    globals: Arc<crate::manager::GlobalBuckets>,
    use_dma32: bool,
    /// Own (caching x order) buckets; present iff the pool allocates
    /// coherently.
    own: Option<BucketGrid>,
    /// Runs currently owned by callers, keyed by first-page address. The
    /// explicit stand-in for stashing the order in the page descriptor.
    sidecar: Mutex<HashMap<usize, Box<PageRun>>>,
    stats: PoolStats,
}

impl Pool {
    pub fn new(mgr: &PoolManager, opts: PoolOptions) -> Self {
        let adapter = Arc::new(PageAdapter::new(
            mgr.backend().clone(),
            opts.dev,
            opts.use_dma_alloc,
        ));
        let zone = if opts.use_dma32 { Zone::Dma32 } else { Zone::Normal };

        let own = opts.use_dma_alloc.then(|| {
            std::array::from_fn(|ci| {
                std::array::from_fn(|order| {
                    let free_adapter = adapter.clone();
                    Bucket::create(
                        mgr.registry(),
                        order,
                        Caching::from_index(ci),
                        zone,
                        Arc::new(move |run| free_adapter.free_run(run)),
                    )
                })
            })
        });

        Self {
            adapter,
            registry: mgr.registry().clone(),
            globals: mgr.globals().clone(),
            use_dma32: opts.use_dma32,
            own,
            sidecar: Mutex::new(HashMap::new()),
            stats: PoolStats::default(),
        }
    }

    /// The bucket serving (caching, order) for this pool, if any. Coherent
    /// pools use their own grid; everyone else shares the process-wide
    /// arrays, which only exist for reprogrammable caching classes.
    fn select_bucket(&self, caching: Caching, order: usize) -> Option<Arc<Bucket>> {
        if let Some(grid) = &self.own {
            return Some(grid[caching.index()][order].clone());
        }
        self.globals.select(caching, order, self.use_dma32).cloned()
    }

    /// Fill the allocation with exactly `num_pages` base pages.
    ///
    /// Walks orders from the largest that fits the remaining count down to
    /// 0, taking pooled runs where available and falling back to the
    /// allocator adapter. On any failure every page already acquired is
    /// rolled back: runs taken from a bucket go back to their bucket, fresh
    /// runs go back to the allocator, so the pooled-page counter ends where
    /// it started and a caller out of memory cannot grow the pool.
    pub fn populate(&self, alloc: &mut PageAllocation, ctx: &AllocContext) -> Result<(), PoolError> {
        if alloc.num_pages == 0 {
            log::warn!("[PagePool] populate of zero pages");
            return Ok(());
        }
        if alloc.is_populated() {
            log::warn!("[PagePool] populate of an already populated allocation");
            alloc.pages.clear();
            if let Some(dmas) = alloc.dma_addrs.as_mut() {
                dmas.clear();
            }
        }

        let mut staged = Vec::new();
        match self.populate_inner(alloc, ctx, &mut staged) {
            Ok(()) => {
                self.stats.populations.fetch_add(1, Ordering::Relaxed);
                let mut sidecar = self.sidecar.lock();
                for entry in staged {
                    sidecar.insert(entry.run.first_page().addr(), entry.run);
                }
                Ok(())
            }
            Err(e) => {
                self.rollback(alloc, staged);
                Err(e)
            }
        }
    }

    fn populate_inner(
        &self,
        alloc: &mut PageAllocation,
        ctx: &AllocContext,
        staged: &mut Vec<StagedRun>,
    ) -> Result<(), PoolError> {
        let mut gfp = AllocFlags::NONE;
        if alloc.zero {
            gfp.insert(AllocFlags::ZERO);
        }
        if ctx.gfp_retry_mayfail {
            gfp.insert(AllocFlags::RETRY_MAYFAIL);
        }
        if self.use_dma32 {
            gfp.insert(AllocFlags::DMA32);
        } else {
            gfp.insert(AllocFlags::HIGHMEM);
        }

        let backend = self.adapter.backend().clone();
        let mut stage = CachingStage::new();
        let mut remaining = alloc.num_pages;

        while remaining > 0 {
            let mut order = fitting_order(remaining);

            // Bucket first, allocator second; on allocator refusal retry
            // one order lower with the same remaining count.
            let (run, origin) = loop {
                if let Some(bucket) = self.select_bucket(alloc.caching, order) {
                    if let Some(run) = bucket.remove() {
                        self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                        break (run, Some(bucket));
                    }
                }
                if ctx.cancelled() {
                    return Err(PoolError::Interrupted);
                }
                match self.adapter.alloc_run(order, alloc.caching, gfp) {
                    Some(run) => {
                        self.stats.fresh_allocs.fetch_add(1, Ordering::Relaxed);
                        break (run, None);
                    }
                    None if order > 0 => order -= 1,
                    None => return Err(PoolError::OutOfMemory),
                }
            };

            // A pooled run is already in its class and a fresh high-memory
            // run has no linear mapping to reprogram: flush the pending
            // fresh pages now and keep this run out of the window.
            let skip_stage = origin.is_some() || run.is_highmem();
            if skip_stage {
                if let Err(e) = stage.flush(&alloc.pages, alloc.caching, backend.as_ref()) {
                    self.put_back(run, origin);
                    return Err(e);
                }
            }

            let mapped = if let Some(dmas) = alloc.dma_addrs.as_mut() {
                match self.adapter.map_run(&run, dmas) {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        // The mapping was refused: this run is unpoolable,
                        // release it immediately.
                        self.adapter.free_run(run);
                        return Err(e);
                    }
                }
            } else {
                None
            };

            for page in run.pages() {
                alloc.pages.push(page);
            }
            if skip_stage {
                stage.skip_to(alloc.pages.len());
            }
            remaining -= run.num_pages();
            staged.push(StagedRun { run, origin, mapped });
        }

        stage.flush(&alloc.pages, alloc.caching, backend.as_ref())
    }

    fn put_back(&self, run: Box<PageRun>, origin: Option<Arc<Bucket>>) {
        match origin {
            Some(bucket) => bucket.add(run),
            None => {
                self.adapter.free_run(run);
            }
        }
    }

    fn rollback(&self, alloc: &mut PageAllocation, staged: Vec<StagedRun>) {
        for entry in staged {
            if let Some(addr) = entry.mapped {
                self.adapter.unmap_run(addr, entry.run.num_pages());
            }
            self.put_back(entry.run, entry.origin);
        }
        alloc.pages.clear();
        if let Some(dmas) = alloc.dma_addrs.as_mut() {
            dmas.clear();
        }
    }

    /// Return every page of the allocation to the pool.
    ///
    /// Runs are recovered through the sidecar map, unmapped when they were
    /// stream-mapped, and deposited into the matching bucket; runs with no
    /// applicable bucket go straight back to the allocator. A page this
    /// pool never handed out is reported and skipped. Finishes by trimming
    /// the pool back under the configured page ceiling.
    pub fn drain(&self, alloc: &mut PageAllocation) {
        if !alloc.is_populated() {
            return;
        }
        let pages = std::mem::take(&mut alloc.pages);
        let dmas = alloc.dma_addrs.as_mut().map(std::mem::take);

        let mut i = 0;
        while i < pages.len() {
            let addr = pages[i].addr();
            let run = self.sidecar.lock().remove(&addr);
            let Some(run) = run else {
                log::error!(
                    "[PagePool] page {:#x} was not handed out by this pool (double free?)",
                    addr
                );
                i += 1;
                continue;
            };

            let num_pages = run.num_pages();
            if let Some(dmas) = &dmas {
                if let Some(&mapped) = dmas.get(i) {
                    self.adapter.unmap_run(mapped, num_pages);
                }
            }
            if run.caching() != alloc.caching {
                log::error!(
                    "[PagePool] run at {:#x} drained as {} but configured {}",
                    addr,
                    alloc.caching.label(),
                    run.caching().label()
                );
            }

            match self.select_bucket(run.caching(), run.order()) {
                Some(bucket) => bucket.add(run),
                None => {
                    self.adapter.free_run(run);
                }
            }
            i += num_pages;
        }

        self.stats.drains.fetch_add(1, Ordering::Relaxed);
        self.registry.enforce_limit();
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            populations: self.stats.populations.load(Ordering::Relaxed),
            drains: self.stats.drains.load(Ordering::Relaxed),
            pool_hits: self.stats.pool_hits.load(Ordering::Relaxed),
            fresh_allocs: self.stats.fresh_allocs.load(Ordering::Relaxed),
        }
    }

    /// Per-order usage dump for this pool's own buckets.
    pub fn report(&self) -> String {
        use std::fmt::Write;

        let Some(grid) = &self.own else {
            return "unused\n".to_string();
        };

        let mut out = String::new();
        out.push('\t');
        for order in 0..MAX_ORDER {
            let _ = write!(out, " ---{:2}---", order);
        }
        out.push('\n');
        for (ci, row) in grid.iter().enumerate() {
            let _ = write!(out, "dma {}\t:", Caching::from_index(ci).label());
            for bucket in row {
                let _ = write!(out, " {:8}", bucket.size());
            }
            out.push('\n');
        }
        out
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let outstanding = self.sidecar.lock().len();
        if outstanding > 0 {
            // The pages may still be referenced; leaking beats freeing
            // memory out from under the caller.
            log::error!(
                "[PagePool] pool dropped with {} runs still owned by callers",
                outstanding
            );
        }
        if let Some(grid) = &self.own {
            for row in grid.iter() {
                for bucket in row {
                    bucket.fini();
                }
            }
        }
    }
}

/// Largest order fitting the remaining page count, recomputed fresh for
/// every placed run.
fn fitting_order(remaining: usize) -> usize {
    (remaining.ilog2() as usize).min(MAX_ORDER - 1)
}
