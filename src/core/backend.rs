/// Backend set: the consistent-hash ring and one pool per backend
use crate::core::pool::{BackendPool, Dialer, PoolSettings, PoolStats};
use crate::core::ring::BackendRing;
use crate::core::Backend;
use crate::error::RoutingError;
use fnv::FnvHashMap;
use std::sync::Arc;

/// Immutable after construction; shared by every session behind an `Arc`.
pub struct Upstreams<D: Dialer> {
    ring: BackendRing,
    pools: FnvHashMap<Backend, BackendPool<D>>,
}

impl<D: Dialer> Upstreams<D> {
    /// Build the ring and one pool per backend sharing `dialer`
    pub fn new(ring: BackendRing, dialer: Arc<D>, settings: PoolSettings) -> Self {
        let pools = ring
            .backends()
            .iter()
            .map(|backend| {
                let pool = BackendPool::new(backend.clone(), Arc::clone(&dialer), settings.clone());
                (backend.clone(), pool)
            })
            .collect();

        Self { ring, pools }
    }

    /// Pool owning `routing_key`
    pub fn select(&self, routing_key: u32) -> Result<&BackendPool<D>, RoutingError> {
        self.ring
            .select(routing_key)
            .and_then(|backend| self.pools.get(backend))
            .ok_or(RoutingError::NoBackend { key: routing_key })
    }

    pub fn ring(&self) -> &BackendRing {
        &self.ring
    }

    pub fn pool(&self, backend: &Backend) -> Option<&BackendPool<D>> {
        self.pools.get(backend)
    }

    /// Per-backend statistics in ring order
    pub fn stats(&self) -> Vec<(Backend, PoolStats)> {
        self.ring
            .backends()
            .iter()
            .filter_map(|backend| {
                self.pools
                    .get(backend)
                    .map(|pool| (backend.clone(), pool.stats()))
            })
            .collect()
    }

    /// Close every pool, waking blocked acquisitions
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}
