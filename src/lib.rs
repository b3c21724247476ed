//! Shared page-pool subsystem
//!
//! Keeps runs of physically contiguous pages around after they are
//! returned, so that the next request for an equivalent run is served from
//! memory instead of the underlying allocator. Re-acquiring such a run is
//! expensive: changing the caching attributes of the linear mapping costs a
//! cross-CPU TLB invalidate, and coherent DMA allocations are slow compared
//! to plain page allocation plus mapping.
//!
//! The subsystem consists of:
//! - Per-(caching, order, zone) [`Bucket`]s of clean runs
//! - A process-wide [`Registry`] of buckets with fair round-robin reclaim
//! - The [`Pool`] facade with populate/drain over a caller page array
//! - A [`DynamicPool`] variant that zeroes returned pages off the fast
//!   path with a background worker
//! - [`shrinker`] plumbing so a host memory-pressure signal can shrink any
//!   pool on demand
//!
//! Pooled pages stay reclaimable the whole time: the registered reclaim
//! participants can take them back whenever the host asks.

pub mod backend;
pub mod bucket;
pub mod caching;
pub mod dynamic;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod run;
pub mod shrinker;

pub use backend::mock;
pub use backend::{AllocFlags, Device, DmaAttrs, MemoryBackend, PageAdapter, SystemMemory};
pub use bucket::Bucket;
pub use caching::Caching;
pub use dynamic::{DynRegistry, DynamicPool};
pub use manager::{PoolConfig, PoolManager};
pub use pool::{AllocContext, PageAllocation, Pool, PoolOptions};
pub use registry::Registry;
pub use run::{DmaAddr, PageRef, PageRun};
pub use shrinker::{ShrinkControl, Shrinker, ShrinkerHost};

/// Size of one base page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of supported allocation orders. The largest run is
/// `2^(MAX_ORDER - 1)` base pages (8 MiB).
pub const MAX_ORDER: usize = 11;

/// Errors surfaced to callers of the populate/alloc paths.
///
/// Everything else (bucket misses, registry contention, caching
/// reprogramming detours) is recovered internally, and invariant
/// violations such as double frees are reported as diagnostics only.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every allocation path was exhausted after falling back to order 0.
    #[error("out of memory: allocation failed down to order 0")]
    OutOfMemory,

    /// The DMA mapping was refused; the affected run was freed, not pooled.
    #[error("DMA mapping failed")]
    MappingFailed,

    /// A pending cancellation was observed during populate; all pages
    /// acquired so far were rolled back.
    #[error("interrupted while populating")]
    Interrupted,

    /// The deferred-clean worker could not be started; pool construction
    /// was rolled back.
    #[error("failed to spawn deferred-clean worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
