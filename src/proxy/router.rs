//! Route matching for incoming HTTP requests.
//!
//! Matches requests to routes based on hostname and path,
//! following Gateway API match precedence.

use std::sync::Arc;

use crate::store::{PathMatch, PathMatchType, Route, RouteStore};

/// Routes incoming HTTP requests to inference routes.
///
/// Thread-safe via shared reference to RouteStore.
/// Implements Gateway API matching priority:
/// - Hostname: Exact > Wildcard > Empty (match all)
/// - Path: Exact > Prefix (longer wins) > none (match all)
///
/// Equal scores are broken by route id so the choice is stable.
pub struct Router {
    store: Arc<RouteStore>,
}

impl Router {
    /// Creates a new Router with the given route store.
    pub fn new(store: Arc<RouteStore>) -> Self {
        Self { store }
    }

    /// Finds the best route for the given host and path.
    ///
    /// Returns `None` if no route matches.
    pub fn find_route(&self, host: &str, path: &str) -> Option<Arc<Route>> {
        let mut best: Option<((usize, usize), Arc<Route>)> = None;

        for route in self.store.get_routes() {
            let Some(hostname_score) = Self::best_hostname_score(&route.hostnames, host) else {
                continue;
            };
            let Some(path_score) = Self::path_score(route.path.as_ref(), path) else {
                continue;
            };
            let score = (hostname_score, path_score);

            let is_better = match &best {
                None => true,
                Some((best_score, best_route)) => {
                    score > *best_score || (score == *best_score && route.id < best_route.id)
                }
            };
            if is_better {
                best = Some((score, route));
            }
        }

        best.map(|(_, route)| route)
    }

    /// Resolves an internal continuation path back to its route.
    pub fn find_internal(&self, internal_path: &str) -> Option<Arc<Route>> {
        self.store.route_for_internal_path(internal_path)
    }

    /// Returns the best hostname score for a list of patterns.
    /// Returns None if no pattern matches.
    fn best_hostname_score(hostnames: &[String], host: &str) -> Option<usize> {
        if hostnames.is_empty() {
            // Empty hostnames = match all hosts with lowest priority
            return Some(0);
        }
        hostnames
            .iter()
            .filter_map(|h| Self::hostname_score(h, host))
            .max()
    }

    /// Scores a hostname match (higher = better match).
    /// Exact matches score higher than wildcards.
    fn hostname_score(pattern: &str, host: &str) -> Option<usize> {
        if !Self::hostname_matches(pattern, host) {
            return None;
        }

        if pattern.starts_with("*.") {
            Some(pattern.len())
        } else {
            Some(pattern.len() + 1000)
        }
    }

    /// Checks if a hostname matches a pattern.
    /// Supports exact match and single-label wildcard (*.example.com).
    fn hostname_matches(pattern: &str, host: &str) -> bool {
        let host = Self::normalize_hostname(host);
        let pattern = pattern.to_lowercase();

        if let Some(suffix) = pattern.strip_prefix('*') {
            // suffix = ".example.com"
            if !host.ends_with(suffix) {
                return false;
            }
            let prefix = &host[..host.len() - suffix.len()];
            !prefix.is_empty() && !prefix.contains('.')
        } else {
            host == pattern
        }
    }

    /// Normalizes a hostname: lowercase and strip port.
    fn normalize_hostname(host: &str) -> String {
        host.split(':').next().unwrap_or(host).to_lowercase()
    }

    /// Scores a path match (higher = better).
    /// Exact > longer prefix > shorter prefix > no path match
    fn path_score(path_match: Option<&PathMatch>, path: &str) -> Option<usize> {
        let Some(pm) = path_match else {
            return Some(0);
        };

        match pm.kind {
            PathMatchType::Exact if path == pm.value => Some(10000 + pm.value.len()),
            PathMatchType::Prefix if Self::prefix_matches(&pm.value, path) => {
                Some(1000 + pm.value.len())
            }
            _ => None,
        }
    }

    /// Prefix matching respecting segment boundaries.
    /// /api matches /api, /api/, /api/users
    /// /api does NOT match /apikeys (no segment boundary)
    fn prefix_matches(prefix: &str, path: &str) -> bool {
        if path == prefix {
            return true;
        }
        if let Some(rest) = path.strip_prefix(prefix) {
            return prefix.ends_with('/') || rest.starts_with('/');
        }
        false
    }
}
