//! Shared helpers for the integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use page_pool::mock::MockBackend;
use page_pool::{Device, Pool, PoolConfig, PoolManager, PoolOptions};

/// Manager over a counting mock backend.
#[allow(dead_code)]
pub fn mock_manager(max_pooled_pages: usize) -> (Arc<MockBackend>, PoolManager) {
    let backend = MockBackend::shared();
    let config = PoolConfig {
        backend: backend.clone(),
        max_pooled_pages,
        ..PoolConfig::default()
    };
    (backend, PoolManager::new(config))
}

/// Coherent-DMA pool: owns a full bucket grid, so every caching class
/// (including cached) is poolable.
#[allow(dead_code)]
pub fn dma_pool(mgr: &PoolManager) -> Pool {
    Pool::new(
        mgr,
        PoolOptions {
            dev: Some(Arc::new(Device::new("test-dev"))),
            use_dma_alloc: true,
            use_dma32: false,
        },
    )
}

/// Poll until `cond` holds; panics after five seconds.
#[allow(dead_code)]
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}
