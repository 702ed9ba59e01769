//! Time-windowed exclusion of upstream routes that failed to connect
//!
//! A route that does not answer a connect attempt can be blacklisted, which
//! keeps it out of PAC candidate lists until the cooldown lapses. Manual
//! single-route mode never consults the blacklist: with one candidate there
//! is no fallback to benefit from the exclusion.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::route::ProxyRoute;

/// A currently blacklisted route as seen by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistedRoute {
    pub route: ProxyRoute,
    /// Seconds until the route becomes usable again.
    pub expires_in_secs: u64,
}

/// Concurrent route blacklist with lazy per-lookup eviction.
pub struct RouteBlacklist {
    /// None disables blacklisting entirely (configured timeout <= 0).
    timeout: Option<Duration>,
    entries: DashMap<ProxyRoute, Instant>,
}

impl RouteBlacklist {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
            entries: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Attempt to blacklist a route. No-op when blacklisting is disabled.
    ///
    /// An already blacklisted, still valid route keeps its existing expiry;
    /// the compute runs under the entry lock so two racing calls for the
    /// same route cannot disagree about it.
    pub fn blacklist(&self, route: &ProxyRoute) -> Option<Instant> {
        let timeout = self.timeout?;
        let now = Instant::now();
        let entry = self
            .entries
            .entry(route.clone())
            .and_modify(|expiry| {
                if *expiry <= now {
                    *expiry = now + timeout;
                }
            })
            .or_insert_with(|| now + timeout);
        debug!("Route {} blacklisted until {:?}", route, *entry);
        Some(*entry)
    }

    /// Whether a route is currently excluded. Expired entries are evicted
    /// by the lookup itself; there is no background sweep.
    pub fn is_blacklisted(&self, route: &ProxyRoute) -> bool {
        if self.timeout.is_none() {
            return false;
        }
        let now = Instant::now();
        self.entries.remove_if(route, |_, expiry| *expiry <= now);
        self.entries.contains_key(route)
    }

    pub fn is_active(&self, route: &ProxyRoute) -> bool {
        !self.is_blacklisted(route)
    }

    /// Drop every entry, returning how many were still in cooldown.
    pub fn clear(&self) -> usize {
        let now = Instant::now();
        let active = self
            .entries
            .iter()
            .filter(|entry| *entry.value() > now)
            .count();
        self.entries.clear();
        active
    }

    /// The currently active entries, for the control surface.
    pub fn snapshot(&self) -> Vec<BlacklistedRoute> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| BlacklistedRoute {
                route: entry.key().clone(),
                expires_in_secs: entry.value().saturating_duration_since(now).as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteKind;

    fn route() -> ProxyRoute {
        ProxyRoute::new(RouteKind::Http, "10.0.0.1", 3128)
    }

    #[test]
    fn test_blacklist_keeps_existing_expiry() {
        let blacklist = RouteBlacklist::new(Some(Duration::from_secs(600)));

        let first = blacklist.blacklist(&route()).unwrap();
        let second = blacklist.blacklist(&route()).unwrap();
        assert_eq!(first, second);
        assert!(blacklist.is_blacklisted(&route()));
    }

    #[test]
    fn test_disabled_blacklist_is_noop() {
        let blacklist = RouteBlacklist::disabled();

        assert!(blacklist.blacklist(&route()).is_none());
        assert!(!blacklist.is_blacklisted(&route()));
        assert_eq!(blacklist.clear(), 0);
    }

    #[test]
    fn test_expired_entry_is_evicted_on_lookup() {
        let blacklist = RouteBlacklist::new(Some(Duration::from_millis(10)));

        blacklist.blacklist(&route()).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert!(!blacklist.is_blacklisted(&route()));
        // The lookup removed the stale entry, so clear finds nothing active.
        assert_eq!(blacklist.clear(), 0);
    }

    #[test]
    fn test_expired_entry_gets_fresh_expiry() {
        let blacklist = RouteBlacklist::new(Some(Duration::from_millis(10)));

        let first = blacklist.blacklist(&route()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let second = blacklist.blacklist(&route()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_clear_counts_only_active_entries() {
        let blacklist = RouteBlacklist::new(Some(Duration::from_secs(600)));

        blacklist.blacklist(&route()).unwrap();
        blacklist
            .blacklist(&ProxyRoute::new(RouteKind::Socks5, "10.0.0.2", 1080))
            .unwrap();

        assert_eq!(blacklist.clear(), 2);
        assert!(!blacklist.is_blacklisted(&route()));
    }

    #[test]
    fn test_snapshot_reports_active_routes() {
        let blacklist = RouteBlacklist::new(Some(Duration::from_secs(600)));
        blacklist.blacklist(&route()).unwrap();

        let snapshot = blacklist.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].route, route());
        assert!(snapshot[0].expires_in_secs <= 600);
    }
}
