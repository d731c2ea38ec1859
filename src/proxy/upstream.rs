//! Pool endpoint selection with health tracking.
//!
//! Endpoints that keep refusing connections are skipped until they
//! accept one again. Each pool keeps its own round-robin position.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::store::{Endpoint, Pool};

/// Tracks health of pool endpoints by address.
///
/// Unknown endpoints are considered healthy. After `failure_threshold`
/// consecutive connection failures an endpoint is unhealthy; a single
/// successful connection restores it.
pub struct HealthTracker {
    failures: DashMap<String, u32>,
    failure_threshold: u32,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failures: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn record_success(&self, address: &str) {
        self.failures.remove(address);
    }

    /// Records a failed connection. Returns true when this failure made
    /// the endpoint unhealthy.
    pub fn record_failure(&self, address: &str) -> bool {
        let mut count = self.failures.entry(address.to_string()).or_insert(0);
        *count += 1;
        *count == self.failure_threshold
    }

    pub fn is_healthy(&self, address: &str) -> bool {
        self.failures
            .get(address)
            .map(|count| *count < self.failure_threshold)
            .unwrap_or(true)
    }

    pub fn healthy_count(&self, endpoints: &[Endpoint]) -> usize {
        endpoints
            .iter()
            .filter(|e| self.is_healthy(&e.address))
            .count()
    }
}

/// Weighted round-robin over the healthy endpoints of a pool.
pub struct LoadBalancer {
    positions: DashMap<String, AtomicUsize>,
    health_tracker: Arc<HealthTracker>,
}

impl LoadBalancer {
    pub fn new(health_tracker: Arc<HealthTracker>) -> Self {
        Self {
            positions: DashMap::new(),
            health_tracker,
        }
    }

    /// Selects the next endpoint of `pool`.
    ///
    /// Returns None if the pool is empty or every endpoint is unhealthy.
    pub fn next<'a>(&self, pool: &'a Pool) -> Option<&'a Endpoint> {
        let tracker = &self.health_tracker;
        let healthy = move || {
            pool.endpoints
                .iter()
                .filter(move |e| tracker.is_healthy(&e.address))
        };
        let total: u64 = healthy().map(weight_of).sum();
        if total == 0 {
            return None;
        }

        let idx = self
            .positions
            .entry(pool.name.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        let mut slot = idx as u64 % total;
        for endpoint in healthy() {
            let weight = weight_of(endpoint);
            if slot < weight {
                return Some(endpoint);
            }
            slot -= weight;
        }
        None
    }

    pub fn health_tracker(&self) -> &Arc<HealthTracker> {
        &self.health_tracker
    }
}

/// Zero weights count as one.
fn weight_of(endpoint: &Endpoint) -> u64 {
    u64::from(endpoint.weight.max(1))
}
