//! End-to-end populate/drain behavior of the pool facade.

mod common;

use common::{dma_pool, mock_manager};
use page_pool::{AllocContext, Caching, PageAllocation, PoolError, MAX_ORDER, PAGE_SIZE};

/// Warm hit: a second round of equivalent allocations is served entirely
/// from the pool, and taking them out empties the pooled-page counter.
#[test]
fn test_warm_hit_serves_from_pool() {
    let (backend, mgr) = mock_manager(1024);
    let pool = dma_pool(&mgr);

    // Four runs of order 2, cached.
    let mut allocs: Vec<PageAllocation> = (0..4)
        .map(|_| PageAllocation::new(4, Caching::Cached))
        .collect();
    for alloc in &mut allocs {
        pool.populate(alloc, &AllocContext::default()).unwrap();
    }
    for alloc in &mut allocs {
        pool.drain(alloc);
    }
    assert_eq!(mgr.total_pooled(), 16);

    let attempts_before = backend.total_alloc_attempts();
    for alloc in &mut allocs {
        pool.populate(alloc, &AllocContext::default()).unwrap();
    }
    assert_eq!(
        backend.total_alloc_attempts(),
        attempts_before,
        "BUG: warm allocation hit the underlying allocator"
    );
    assert_eq!(mgr.total_pooled(), 0, "pool counter must drop to 0 after re-populate");

    for alloc in &mut allocs {
        pool.drain(alloc);
    }
}

/// Order fallback: with every order > 0 refused, a 9-page request walks
/// 3 -> 2 -> 1 -> 0 each iteration and succeeds with nine order-0 runs.
#[test]
fn test_order_fallback_to_zero() {
    let (backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);
    backend.refuse_orders_above(0);

    let mut alloc = PageAllocation::new(9, Caching::Cached);
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();

    assert_eq!(alloc.pages().len(), 9);
    assert_eq!(backend.alloc_successes(0), 9, "BUG: expected nine order-0 allocations");
    // Every iteration restarts the ladder at the largest fitting order.
    assert!(backend.alloc_attempts(3) >= 1);
    assert!(backend.alloc_attempts(2) >= 1);
    assert!(backend.alloc_attempts(1) >= 1);
    assert!(backend.alloc_attempts(2) >= backend.alloc_attempts(3));

    pool.drain(&mut alloc);
}

/// Round trip: populate then drain restores the pooled counters (the cap
/// is disabled here, so no trimming interferes).
#[test]
fn test_populate_drain_round_trip() {
    let (backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);

    let pooled_before = mgr.total_pooled();
    let mut alloc = PageAllocation::new(25, Caching::Cached);
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();
    assert_eq!(alloc.pages().len(), 25);
    pool.drain(&mut alloc);
    assert_eq!(mgr.total_pooled(), pooled_before + 25);

    // A second cycle reuses every pooled run.
    let attempts = backend.total_alloc_attempts();
    let mut alloc = PageAllocation::new(25, Caching::Cached);
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();
    assert_eq!(backend.total_alloc_attempts(), attempts);
    pool.drain(&mut alloc);

    assert_eq!(
        mgr.registry().counted_pages(),
        mgr.total_pooled(),
        "BUG: atomic counter and per-bucket counts disagree at quiescence"
    );
}

/// The ladder never starts above the top supported order.
#[test]
fn test_never_requests_above_max_order() {
    let (backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);

    let mut alloc = PageAllocation::new(5000, Caching::Cached);
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();
    assert!(
        backend.max_order_seen() <= MAX_ORDER - 1,
        "BUG: allocator saw order {} request",
        backend.max_order_seen()
    );
    pool.drain(&mut alloc);
}

/// A failed populate leaves the pooled counter exactly where it was.
#[test]
fn test_failed_populate_preserves_counter() {
    let (backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);

    let mut warm = PageAllocation::new(8, Caching::Cached);
    pool.populate(&mut warm, &AllocContext::default()).unwrap();
    pool.drain(&mut warm);
    let pooled_before = mgr.total_pooled();
    assert_eq!(pooled_before, 8);

    backend.set_refuse_all(true);
    let mut alloc = PageAllocation::new(64, Caching::Cached);
    let result = pool.populate(&mut alloc, &AllocContext::default());
    assert!(matches!(result, Err(PoolError::OutOfMemory)));
    assert!(!alloc.is_populated());
    assert_eq!(
        mgr.total_pooled(),
        pooled_before,
        "BUG: failed populate changed the pooled counter"
    );
    assert_eq!(
        mgr.registry().counted_pages(),
        pooled_before,
        "BUG: rollback left bucket contents inconsistent"
    );
    backend.set_refuse_all(false);
}

/// Zeroed fresh allocations actually read as zeros.
#[test]
fn test_zero_flag_zeroes_fresh_pages() {
    let (_backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);

    let mut alloc = PageAllocation::new(4, Caching::Cached).with_zero();
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();
    for page in alloc.pages() {
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0), "BUG: fresh page not zeroed");
    }
    pool.drain(&mut alloc);
}

/// Per-page DMA addresses cover each run contiguously.
#[test]
fn test_dma_addresses_are_contiguous_per_run() {
    let (_backend, mgr) = mock_manager(0);
    let pool = dma_pool(&mgr);

    let mut alloc = PageAllocation::new(8, Caching::Cached).with_dma();
    pool.populate(&mut alloc, &AllocContext::default()).unwrap();

    let dmas = alloc.dma_addrs().expect("requested DMA addresses");
    assert_eq!(dmas.len(), 8);
    for i in 1..8 {
        assert_eq!(dmas[i], dmas[0] + (i * PAGE_SIZE) as u64);
    }
    pool.drain(&mut alloc);
}

/// Nothing leaks across a full pool lifetime.
#[test]
fn test_no_leaks_after_teardown() {
    let (backend, mgr) = mock_manager(16);
    {
        let pool = dma_pool(&mgr);
        for _ in 0..8 {
            let mut alloc = PageAllocation::new(6, Caching::Cached);
            pool.populate(&mut alloc, &AllocContext::default()).unwrap();
            pool.drain(&mut alloc);
        }
    }
    // Pool drop drained its buckets back to the backend.
    assert_eq!(backend.outstanding(), 0, "BUG: teardown leaked runs");
    assert_eq!(mgr.total_pooled(), 0);
}
