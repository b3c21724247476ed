//! Subsystem lifecycle: global buckets, accounting and reclaim hookup
//!
//! One [`PoolManager`] owns what the subsystem shares process-wide: the
//! bucket registry, the four global bucket arrays (write-combined and
//! uncached, each in normal and 32-bit zones), the dynamic-pool registry
//! and the two reclaim participants. Creating the manager is subsystem
//! init; dropping it drains the global buckets and checks that nothing is
//! left registered.

use std::sync::Arc;

use crate::backend::{MemoryBackend, PageAdapter, SystemMemory, Zone};
use crate::bucket::Bucket;
use crate::caching::{Caching, HAVE_CACHING_ATTRS};
use crate::dynamic::DynRegistry;
use crate::registry::Registry;
use crate::shrinker::{Shrinker, ShrinkerHost, ShrinkerId};
use crate::MAX_ORDER;

/// Subsystem configuration.
#[derive(Clone)]
pub struct PoolConfig {
    /// The environment to allocate from.
    pub backend: Arc<dyn MemoryBackend>,
    /// Page ceiling across all buckets, enforced synchronously after
    /// drains. 0 disables the trim. Typically set to a fraction of
    /// physical memory at init time.
    pub max_pooled_pages: usize,
    /// Runs zeroed per cleaning batch in dynamic pools.
    pub clean_batch: usize,
    /// Cleaning batches per worker wake in dynamic pools.
    pub clean_passes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: Arc::new(SystemMemory),
            max_pooled_pages: 0,
            clean_batch: 32,
            clean_passes: 4,
        }
    }
}

/// The four process-wide bucket arrays shared by every non-coherent pool.
pub(crate) struct GlobalBuckets {
    write_combined: [Arc<Bucket>; MAX_ORDER],
    uncached: [Arc<Bucket>; MAX_ORDER],
    dma32_write_combined: [Arc<Bucket>; MAX_ORDER],
    dma32_uncached: [Arc<Bucket>; MAX_ORDER],
}

impl GlobalBuckets {
    fn new(registry: &Arc<Registry>, adapter: Arc<PageAdapter>) -> Arc<Self> {
        let make = |caching: Caching, zone: Zone| -> [Arc<Bucket>; MAX_ORDER] {
            std::array::from_fn(|order| {
                let free_adapter = adapter.clone();
                Bucket::create(
                    registry,
                    order,
                    caching,
                    zone,
                    Arc::new(move |run| free_adapter.free_run(run)),
                )
            })
        };
        Arc::new(Self {
            write_combined: make(Caching::WriteCombined, Zone::Normal),
            uncached: make(Caching::Uncached, Zone::Normal),
            dma32_write_combined: make(Caching::WriteCombined, Zone::Dma32),
            dma32_uncached: make(Caching::Uncached, Zone::Dma32),
        })
    }

    /// The global bucket for (caching, order) in the effective zone.
    /// Cached pages are never pooled globally, and without reprogrammable
    /// caching attributes nothing is.
    pub(crate) fn select(&self, caching: Caching, order: usize, dma32: bool) -> Option<&Arc<Bucket>> {
        if !HAVE_CACHING_ATTRS {
            return None;
        }
        match caching {
            Caching::WriteCombined => Some(if dma32 {
                &self.dma32_write_combined[order]
            } else {
                &self.write_combined[order]
            }),
            Caching::Uncached => Some(if dma32 {
                &self.dma32_uncached[order]
            } else {
                &self.uncached[order]
            }),
            Caching::Cached => None,
        }
    }

    fn rows(&self) -> [(&'static str, &[Arc<Bucket>; MAX_ORDER]); 4] {
        [
            ("wc", &self.write_combined),
            ("uc", &self.uncached),
            ("wc 32", &self.dma32_write_combined),
            ("uc 32", &self.dma32_uncached),
        ]
    }

    fn fini_all(&self) {
        for (_, row) in self.rows() {
            for bucket in row.iter() {
                bucket.fini();
            }
        }
    }
}

/// Owner of the process-wide pool state.
pub struct PoolManager {
    backend: Arc<dyn MemoryBackend>,
    registry: Arc<Registry>,
    globals: Arc<GlobalBuckets>,
    dyn_pools: Arc<DynRegistry>,
    host: Arc<ShrinkerHost>,
    clean_batch: usize,
    clean_passes: usize,
    bucket_shrinker: ShrinkerId,
    dyn_shrinker: ShrinkerId,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_host(config, Arc::new(ShrinkerHost::new()))
    }

    /// Initialize the subsystem and register its reclaim participants
    /// with `host`.
    pub fn with_host(config: PoolConfig, host: Arc<ShrinkerHost>) -> Self {
        let registry = Registry::new();
        registry.set_max_pooled(config.max_pooled_pages);

        let adapter = Arc::new(PageAdapter::new(config.backend.clone(), None, false));
        let globals = GlobalBuckets::new(&registry, adapter);
        let dyn_pools = DynRegistry::new();

        let bucket_shrinker = {
            let count_registry = registry.clone();
            let scan_registry = registry.clone();
            host.register(Shrinker::new(
                "page-pool-buckets",
                1,
                0,
                Box::new(move |_sc| match count_registry.total_pages() {
                    0 => None,
                    pages => Some(pages),
                }),
                Box::new(move |sc| scan_registry.scan(sc.nr_to_scan)),
            ))
        };

        let dyn_shrinker = {
            let count_pools = dyn_pools.clone();
            let scan_pools = dyn_pools.clone();
            host.register(Shrinker::new(
                "page-pool-dynamic",
                2,
                0,
                Box::new(move |sc| match count_pools.count(sc) {
                    0 => None,
                    pages => Some(pages),
                }),
                Box::new(move |sc| scan_pools.shrink(sc)),
            ))
        };

        log::info!(
            "[PagePool] initialized: max_pooled={} pages, {} global buckets",
            config.max_pooled_pages,
            registry.len()
        );

        Self {
            backend: config.backend,
            registry,
            globals,
            dyn_pools,
            host,
            clean_batch: config.clean_batch,
            clean_passes: config.clean_passes,
            bucket_shrinker,
            dyn_shrinker,
        }
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shrinker_host(&self) -> &Arc<ShrinkerHost> {
        &self.host
    }

    pub fn dyn_pools(&self) -> &Arc<DynRegistry> {
        &self.dyn_pools
    }

    pub(crate) fn globals(&self) -> &Arc<GlobalBuckets> {
        &self.globals
    }

    pub(crate) fn clean_batch(&self) -> usize {
        self.clean_batch
    }

    pub(crate) fn clean_passes(&self) -> usize {
        self.clean_passes
    }

    /// Base pages pooled across all buckets.
    pub fn total_pooled(&self) -> usize {
        self.registry.total_pages()
    }

    /// Per-order dump of the global buckets plus the totals line.
    pub fn report(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        out.push('\t');
        for order in 0..MAX_ORDER {
            let _ = write!(out, " ---{:2}---", order);
        }
        out.push('\n');
        for (label, row) in self.globals.rows() {
            let _ = write!(out, "{}\t:", label);
            for bucket in row.iter() {
                let _ = write!(out, " {:8}", bucket.size());
            }
            out.push('\n');
        }
        let _ = write!(
            out,
            "\ntotal\t: {:8} of {:8}\n",
            self.registry.total_pages(),
            self.registry.max_pooled()
        );
        out
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.host.unregister(self.bucket_shrinker);
        self.host.unregister(self.dyn_shrinker);

        self.globals.fini_all();

        let stragglers = self.registry.len();
        if stragglers != 0 {
            log::error!(
                "[PagePool] teardown with {} buckets still registered; pools outlive their manager",
                stragglers
            );
        }
        if self.dyn_pools.pool_count() != 0 {
            log::error!(
                "[PagePool] teardown with {} dynamic pools still registered",
                self.dyn_pools.pool_count()
            );
        }
    }
}
