//! Allocator adapter and the external allocation interfaces
//!
//! Everything the pool needs from its environment goes through
//! [`MemoryBackend`]: the page allocator, the coherent DMA allocator, the
//! streaming DMA mapping calls and the caching-attribute primitives.
//! [`SystemMemory`] is the in-process default; [`mock::MockBackend`] wraps
//! it with counters and fault injection for tests.
//!
//! [`PageAdapter`] sits between runs and the backend. It comes in two
//! capability variants: `Plain` allocates discrete page runs and maps them
//! per request, `CoherentDma` goes through the coherent allocator and keeps
//! the original (vaddr, dma) pair with the run for its whole life.

use core::ptr::NonNull;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

use crate::caching::{Caching, HAVE_CACHING_ATTRS};
use crate::run::{CoherentDma, DmaAddr, PageRef, PageRun};
use crate::{PoolError, MAX_ORDER, PAGE_SIZE};

/// Allocation-time flags, the gfp-mask analog.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AllocFlags {
    bits: u32,
}

impl AllocFlags {
    pub const NONE: Self = Self { bits: 0 };
    /// Return zero-initialized memory.
    pub const ZERO: Self = Self { bits: 1 << 0 };
    /// The caller would rather see a failure than heavy reclaim retries.
    pub const RETRY_MAYFAIL: Self = Self { bits: 1 << 1 };
    /// Constrain the run to 32-bit addressable memory.
    pub const DMA32: Self = Self { bits: 1 << 2 };
    /// High memory is acceptable.
    pub const HIGHMEM: Self = Self { bits: 1 << 3 };
    /// Fail fast instead of retrying; set for every order > 0 attempt so
    /// the order fallback ladder stays cheap.
    pub const NO_RETRY: Self = Self { bits: 1 << 4 };
    /// Suppress allocation-failure noise; order > 0 misses are expected.
    pub const NO_WARN: Self = Self { bits: 1 << 5 };

    pub fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn insert(&mut self, other: Self) {
        self.bits |= other.bits;
    }

    pub fn with(mut self, other: Self) -> Self {
        self.insert(other);
        self
    }
}

/// Attribute bits for the coherent DMA entry points.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DmaAttrs {
    bits: u32,
}

impl DmaAttrs {
    pub const NONE: Self = Self { bits: 0 };
    /// The whole run must be physically contiguous.
    pub const FORCE_CONTIGUOUS: Self = Self { bits: 1 << 0 };
    /// Suppress failure noise for speculative order > 0 attempts.
    pub const NO_WARN: Self = Self { bits: 1 << 1 };

    pub fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn with(mut self, other: Self) -> Self {
        self.bits |= other.bits;
        self
    }
}

/// Memory-region qualifier for a bucket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Zone {
    Normal,
    Dma32,
}

/// Opaque device token handed through to the DMA entry points.
#[derive(Debug)]
pub struct Device {
    name: String,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The environment the pool allocates from.
///
/// All methods may suspend the caller; none are invoked with a bucket lock
/// held. The caching primitives default to no-ops, matching targets where
/// linear-mapping attributes cannot be reprogrammed.
pub trait MemoryBackend: Send + Sync {
    /// Allocate a naturally aligned run of `2^order` pages, or refuse.
    fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Release a run previously returned by [`Self::alloc_pages`]. Infallible.
    fn free_pages(&self, base: NonNull<u8>, order: usize);

    /// Whether the page sits in high memory (no permanent linear mapping).
    fn page_is_highmem(&self, _base: NonNull<u8>) -> bool {
        false
    }

    /// Coherent allocation: CPU-visible and device-visible address for the
    /// same region.
    fn dma_alloc(
        &self,
        dev: &Device,
        bytes: usize,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Option<(NonNull<u8>, DmaAddr)>;

    fn dma_free(&self, dev: &Device, bytes: usize, vaddr: NonNull<u8>, addr: DmaAddr, attrs: DmaAttrs);

    /// Streaming bidirectional mapping of an already allocated run.
    fn dma_map(&self, dev: &Device, base: NonNull<u8>, bytes: usize) -> Option<DmaAddr>;

    fn dma_unmap(&self, dev: &Device, addr: DmaAddr, bytes: usize);

    /// Batch-transition pages to write-combined. Returns false on failure.
    fn set_pages_wc(&self, _pages: &[PageRef]) -> bool {
        true
    }

    /// Batch-transition pages to uncached. Returns false on failure.
    fn set_pages_uc(&self, _pages: &[PageRef]) -> bool {
        true
    }

    /// Reset a run to ordinary write-back caching.
    fn set_pages_wb(&self, _base: NonNull<u8>, _count: usize) {}

    /// Temporarily map the batch contiguously, zero it, and unmap it.
    /// Returns false when the mapping cannot be made.
    ///
    /// In-process pages are identity mapped, so the default zeroes them
    /// directly.
    fn zero_mapped(&self, pages: &[PageRef]) -> bool {
        for p in pages {
            unsafe { core::ptr::write_bytes(p.as_ptr(), 0, PAGE_SIZE) };
        }
        true
    }
}

/// Default backend over the process allocator.
///
/// Runs are naturally aligned (`align == PAGE_SIZE << order`) like buddy
/// allocations, DMA addresses are identity, and attribute reprogramming is
/// a no-op.
pub struct SystemMemory;

impl SystemMemory {
    fn layout(order: usize) -> Layout {
        let size = PAGE_SIZE << order;
        Layout::from_size_align(size, size).expect("power-of-two run layout")
    }
}

impl MemoryBackend for SystemMemory {
    fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if order >= MAX_ORDER {
            return None;
        }
        let layout = Self::layout(order);
        let ptr = if flags.contains(AllocFlags::ZERO) {
            unsafe { alloc_zeroed(layout) }
        } else {
            unsafe { alloc(layout) }
        };
        NonNull::new(ptr)
    }

    fn free_pages(&self, base: NonNull<u8>, order: usize) {
        unsafe { dealloc(base.as_ptr(), Self::layout(order)) };
    }

    fn dma_alloc(
        &self,
        _dev: &Device,
        bytes: usize,
        flags: AllocFlags,
        _attrs: DmaAttrs,
    ) -> Option<(NonNull<u8>, DmaAddr)> {
        let order = (bytes / PAGE_SIZE).trailing_zeros() as usize;
        let vaddr = self.alloc_pages(order, flags)?;
        Some((vaddr, vaddr.as_ptr() as DmaAddr))
    }

    fn dma_free(&self, _dev: &Device, bytes: usize, vaddr: NonNull<u8>, _addr: DmaAddr, _attrs: DmaAttrs) {
        let order = (bytes / PAGE_SIZE).trailing_zeros() as usize;
        self.free_pages(vaddr, order);
    }

    fn dma_map(&self, _dev: &Device, base: NonNull<u8>, _bytes: usize) -> Option<DmaAddr> {
        Some(base.as_ptr() as DmaAddr)
    }

    fn dma_unmap(&self, _dev: &Device, _addr: DmaAddr, _bytes: usize) {}
}

/// How runs go back to the environment.
enum ReleaseMode {
    /// Plain page allocator plus streaming mappings on demand.
    Plain,
    /// Coherent DMA allocator; runs carry their original (vaddr, dma) pair.
    CoherentDma,
}

/// Bridges runs to the backend for one pool.
///
/// The adapter owns the policy half of the free callback installed into
/// buckets: reset the caching attributes, then release through whichever
/// allocator produced the run.
pub struct PageAdapter {
    backend: Arc<dyn MemoryBackend>,
    dev: Option<Arc<Device>>,
    mode: ReleaseMode,
}

impl PageAdapter {
    pub fn new(backend: Arc<dyn MemoryBackend>, dev: Option<Arc<Device>>, use_dma_alloc: bool) -> Self {
        if use_dma_alloc && dev.is_none() {
            log::error!("[PagePool] coherent DMA adapter without a device; allocations will fail");
        }
        Self {
            backend,
            dev,
            mode: if use_dma_alloc {
                ReleaseMode::CoherentDma
            } else {
                ReleaseMode::Plain
            },
        }
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn is_coherent(&self) -> bool {
        matches!(self.mode, ReleaseMode::CoherentDma)
    }

    /// Allocate one run of the given order, tagged with the caching class
    /// the caller will configure it for.
    pub fn alloc_run(&self, order: usize, caching: Caching, flags: AllocFlags) -> Option<Box<PageRun>> {
        let mut flags = flags;
        if order > 0 {
            // Higher orders are speculative; fail fast and quietly.
            flags.insert(AllocFlags::NO_RETRY);
            flags.insert(AllocFlags::NO_WARN);
        }

        match self.mode {
            ReleaseMode::Plain => {
                let base = self.backend.alloc_pages(order, flags)?;
                let highmem = self.backend.page_is_highmem(base);
                Some(Box::new(PageRun::new(base, order, caching).with_highmem(highmem)))
            }
            ReleaseMode::CoherentDma => {
                let dev = self.dev.as_ref()?;
                let mut attrs = DmaAttrs::FORCE_CONTIGUOUS;
                if order > 0 {
                    attrs = attrs.with(DmaAttrs::NO_WARN);
                }
                let bytes = PAGE_SIZE << order;
                let (vaddr, addr) = self.backend.dma_alloc(dev, bytes, flags, attrs)?;
                let run = PageRun::new(vaddr, order, caching).with_dma(CoherentDma { addr, vaddr });
                Some(Box::new(run))
            }
        }
    }

    /// Release a run. Resets the linear-mapping attributes first when the
    /// run was configured away from ordinary write-back caching. Returns
    /// the number of base pages released.
    pub fn free_run(&self, run: Box<PageRun>) -> usize {
        let pages = run.num_pages();

        // Inefficiency here is fine: this path only runs on shrink or
        // teardown, never on the hot path.
        if HAVE_CACHING_ATTRS && run.caching() != Caching::Cached && !run.is_highmem() {
            self.backend.set_pages_wb(run.base(), pages);
        }

        match (run.dma(), self.dev.as_ref()) {
            (Some(dma), Some(dev)) => {
                let mut attrs = DmaAttrs::FORCE_CONTIGUOUS;
                if run.order() > 0 {
                    attrs = attrs.with(DmaAttrs::NO_WARN);
                }
                self.backend
                    .dma_free(dev, PAGE_SIZE << run.order(), dma.vaddr, dma.addr, attrs);
            }
            (Some(_), None) => {
                // Cannot happen through the normal paths; the run cannot be
                // returned coherently without its device.
                log::error!("[PagePool] coherent run freed without a device; releasing as plain pages");
                self.backend.free_pages(run.base(), run.order());
            }
            (None, _) => self.backend.free_pages(run.base(), run.order()),
        }
        pages
    }

    /// Fill the per-page DMA addresses for a run, mapping it first on the
    /// plain path. Returns the run-level address for later unmapping.
    pub fn map_run(&self, run: &PageRun, out: &mut Vec<DmaAddr>) -> Result<DmaAddr, PoolError> {
        let addr = if let Some(dma) = run.dma() {
            dma.addr
        } else {
            let dev = self.dev.as_ref().ok_or(PoolError::MappingFailed)?;
            self.backend
                .dma_map(dev, run.base(), PAGE_SIZE << run.order())
                .ok_or(PoolError::MappingFailed)?
        };

        let mut a = addr;
        for _ in 0..run.num_pages() {
            out.push(a);
            a += PAGE_SIZE as DmaAddr;
        }
        Ok(addr)
    }

    /// Undo a streaming mapping. Coherent runs are unmapped by their free.
    pub fn unmap_run(&self, addr: DmaAddr, num_pages: usize) {
        if self.is_coherent() {
            return;
        }
        if let Some(dev) = self.dev.as_ref() {
            self.backend.dma_unmap(dev, addr, num_pages * PAGE_SIZE);
        }
    }
}

pub mod mock {
    //! Counting and fault-injecting backend for tests.
    //!
    //! Wraps [`SystemMemory`] so pages are real, readable memory, while
    //! recording every call and letting tests refuse allocations per
    //! order, fail DMA mapping, simulate high memory and check for leaks.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MockState {
        alloc_attempts: [u64; MAX_ORDER],
        alloc_successes: [u64; MAX_ORDER],
        frees: u64,
        dma_allocs: u64,
        dma_frees: u64,
        maps: u64,
        unmaps: u64,
        wc_pages: u64,
        uc_pages: u64,
        wb_pages: u64,
        zero_batches: u64,
        max_order_seen: usize,
        refuse_above: Option<usize>,
        refuse_all: bool,
        refuse_dma_map: bool,
        fail_zero_map: bool,
        highmem_allocs: bool,
        highmem: HashSet<usize>,
        outstanding: HashMap<usize, usize>,
        double_frees: u64,
        order_mismatches: u64,
    }

    pub struct MockBackend {
        sys: SystemMemory,
        state: Mutex<MockState>,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                sys: SystemMemory,
                state: Mutex::new(MockState::default()),
            }
        }

        pub fn shared() -> Arc<Self> {
            Arc::new(Self::new())
        }

        /// Refuse page and DMA allocations with order greater than `order`.
        pub fn refuse_orders_above(&self, order: usize) {
            self.state.lock().refuse_above = Some(order);
        }

        pub fn allow_all_orders(&self) {
            self.state.lock().refuse_above = None;
        }

        pub fn set_refuse_all(&self, refuse: bool) {
            self.state.lock().refuse_all = refuse;
        }

        pub fn set_refuse_dma_map(&self, refuse: bool) {
            self.state.lock().refuse_dma_map = refuse;
        }

        pub fn set_fail_zero_map(&self, fail: bool) {
            self.state.lock().fail_zero_map = fail;
        }

        /// Mark subsequent allocations as high memory.
        pub fn set_highmem_allocs(&self, on: bool) {
            self.state.lock().highmem_allocs = on;
        }

        fn refused(state: &MockState, order: usize) -> bool {
            state.refuse_all || state.refuse_above.map_or(false, |max| order > max)
        }

        pub fn alloc_attempts(&self, order: usize) -> u64 {
            self.state.lock().alloc_attempts[order]
        }

        pub fn alloc_successes(&self, order: usize) -> u64 {
            self.state.lock().alloc_successes[order]
        }

        pub fn total_alloc_attempts(&self) -> u64 {
            self.state.lock().alloc_attempts.iter().sum()
        }

        pub fn dma_allocs(&self) -> u64 {
            self.state.lock().dma_allocs
        }

        pub fn frees(&self) -> u64 {
            self.state.lock().frees
        }

        pub fn dma_frees(&self) -> u64 {
            self.state.lock().dma_frees
        }

        pub fn maps(&self) -> u64 {
            self.state.lock().maps
        }

        pub fn unmaps(&self) -> u64 {
            self.state.lock().unmaps
        }

        /// (write-combined, uncached, write-back) page transition counts.
        pub fn transitions(&self) -> (u64, u64, u64) {
            let s = self.state.lock();
            (s.wc_pages, s.uc_pages, s.wb_pages)
        }

        pub fn zero_batches(&self) -> u64 {
            self.state.lock().zero_batches
        }

        pub fn max_order_seen(&self) -> usize {
            self.state.lock().max_order_seen
        }

        /// Allocations not yet freed; zero means no leaks.
        pub fn outstanding(&self) -> usize {
            self.state.lock().outstanding.len()
        }

        pub fn double_frees(&self) -> u64 {
            self.state.lock().double_frees
        }

        pub fn order_mismatches(&self) -> u64 {
            self.state.lock().order_mismatches
        }

        fn record_alloc(state: &mut MockState, addr: usize, order: usize) {
            state.alloc_successes[order] += 1;
            state.outstanding.insert(addr, order);
            if state.highmem_allocs {
                state.highmem.insert(addr);
            }
        }

        fn record_free(state: &mut MockState, addr: usize, order: usize) -> bool {
            match state.outstanding.remove(&addr) {
                Some(recorded) => {
                    if recorded != order {
                        state.order_mismatches += 1;
                        log::error!(
                            "[MockBackend] free of {:#x} with order {} but allocated with order {}",
                            addr,
                            order,
                            recorded
                        );
                    }
                    state.highmem.remove(&addr);
                    true
                }
                None => {
                    state.double_frees += 1;
                    log::error!("[MockBackend] free of {:#x} never allocated (double free?)", addr);
                    false
                }
            }
        }
    }

    impl MemoryBackend for MockBackend {
        fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
            let mut state = self.state.lock();
            state.alloc_attempts[order] += 1;
            state.max_order_seen = state.max_order_seen.max(order);
            if Self::refused(&state, order) {
                return None;
            }
            let base = self.sys.alloc_pages(order, flags)?;
            Self::record_alloc(&mut state, base.as_ptr() as usize, order);
            Some(base)
        }

        fn free_pages(&self, base: NonNull<u8>, order: usize) {
            let mut state = self.state.lock();
            if Self::record_free(&mut state, base.as_ptr() as usize, order) {
                state.frees += 1;
                drop(state);
                self.sys.free_pages(base, order);
            }
        }

        fn page_is_highmem(&self, base: NonNull<u8>) -> bool {
            self.state.lock().highmem.contains(&(base.as_ptr() as usize))
        }

        fn dma_alloc(
            &self,
            dev: &Device,
            bytes: usize,
            flags: AllocFlags,
            attrs: DmaAttrs,
        ) -> Option<(NonNull<u8>, DmaAddr)> {
            let order = (bytes / PAGE_SIZE).trailing_zeros() as usize;
            let mut state = self.state.lock();
            state.alloc_attempts[order] += 1;
            state.max_order_seen = state.max_order_seen.max(order);
            if Self::refused(&state, order) {
                return None;
            }
            let (vaddr, addr) = self.sys.dma_alloc(dev, bytes, flags, attrs)?;
            state.dma_allocs += 1;
            Self::record_alloc(&mut state, vaddr.as_ptr() as usize, order);
            Some((vaddr, addr))
        }

        fn dma_free(&self, dev: &Device, bytes: usize, vaddr: NonNull<u8>, addr: DmaAddr, attrs: DmaAttrs) {
            let order = (bytes / PAGE_SIZE).trailing_zeros() as usize;
            let mut state = self.state.lock();
            if Self::record_free(&mut state, vaddr.as_ptr() as usize, order) {
                state.dma_frees += 1;
                drop(state);
                self.sys.dma_free(dev, bytes, vaddr, addr, attrs);
            }
        }

        fn dma_map(&self, dev: &Device, base: NonNull<u8>, bytes: usize) -> Option<DmaAddr> {
            let mut state = self.state.lock();
            if state.refuse_dma_map {
                return None;
            }
            state.maps += 1;
            drop(state);
            self.sys.dma_map(dev, base, bytes)
        }

        fn dma_unmap(&self, dev: &Device, addr: DmaAddr, bytes: usize) {
            self.state.lock().unmaps += 1;
            self.sys.dma_unmap(dev, addr, bytes);
        }

        fn set_pages_wc(&self, pages: &[PageRef]) -> bool {
            self.state.lock().wc_pages += pages.len() as u64;
            true
        }

        fn set_pages_uc(&self, pages: &[PageRef]) -> bool {
            self.state.lock().uc_pages += pages.len() as u64;
            true
        }

        fn set_pages_wb(&self, _base: NonNull<u8>, count: usize) {
            self.state.lock().wb_pages += count as u64;
        }

        fn zero_mapped(&self, pages: &[PageRef]) -> bool {
            {
                let mut state = self.state.lock();
                if state.fail_zero_map {
                    return false;
                }
                state.zero_batches += 1;
            }
            for p in pages {
                unsafe { core::ptr::write_bytes(p.as_ptr(), 0, PAGE_SIZE) };
            }
            true
        }
    }
}
