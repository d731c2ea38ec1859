//! Thread-safe route storage using DashMap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::Route;

/// Thread-safe storage for inference routes.
///
/// Uses `DashMap` for lock-free concurrent access and `AtomicU64`
/// for version tracking. Routes are also indexed by internal path so
/// that a continuation can re-enter routing.
pub struct RouteStore {
    routes: DashMap<String, Arc<Route>>,
    internal_paths: DashMap<String, String>,
    version: AtomicU64,
}

impl RouteStore {
    /// Creates a new empty route store.
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            internal_paths: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Replaces all routes.
    ///
    /// Returns the applied version.
    pub fn update_routes(&self, routes: Vec<Route>, version: u64) -> u64 {
        self.routes.clear();
        self.internal_paths.clear();

        for route in routes {
            self.internal_paths
                .insert(route.internal_path(), route.id.clone());
            self.routes.insert(route.id.clone(), Arc::new(route));
        }

        self.version.store(version, Ordering::SeqCst);
        version
    }

    /// Returns all routes.
    pub fn get_routes(&self) -> Vec<Arc<Route>> {
        self.routes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get_route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the route owning an internal continuation path.
    pub fn route_for_internal_path(&self, path: &str) -> Option<Arc<Route>> {
        let id = self.internal_paths.get(path)?.value().clone();
        self.get_route(&id)
    }

    /// Returns the current configuration version. Zero until routes are loaded.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl Default for RouteStore {
    fn default() -> Self {
        Self::new()
    }
}
