//! Credential lookup for upstream routes
//!
//! The facade does not own credential storage; it consumes a
//! [`CredentialsProvider`] when it builds an authenticated request or
//! tunnel, and passes the resolved credentials into the attempt explicitly.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use std::sync::Arc;

use crate::route::ProxyRoute;

/// Username/password pair for an upstream proxy.
///
/// The username may carry an NTLM-style domain prefix (`DOMAIN\user`);
/// schemes that do not understand domains get the bare user part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username with any `DOMAIN\` prefix removed.
    pub fn bare_username(&self) -> &str {
        match self.username.rsplit_once('\\') {
            Some((_, user)) => user,
            None => &self.username,
        }
    }

    /// The `Basic` authorization parameter for these credentials.
    pub fn basic_token(&self) -> String {
        BASE64.encode(format!("{}:{}", self.bare_username(), self.password))
    }
}

/// Source of credentials for routes that require authentication.
pub trait CredentialsProvider: Send + Sync {
    /// Credentials for the given route, or None when the route is expected
    /// to work unauthenticated (or with ambient system credentials).
    fn credentials_for(&self, route: &ProxyRoute) -> Option<Credentials>;
}

/// Provider backed by a single statically configured pair, handed out for
/// every proxied route.
pub struct StaticCredentials {
    credentials: Option<Credentials>,
}

impl StaticCredentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        let credentials = username.map(|username| Credentials {
            username,
            password: password.unwrap_or_default(),
        });
        Self { credentials }
    }

    pub fn none() -> Self {
        Self { credentials: None }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials_for(&self, route: &ProxyRoute) -> Option<Credentials> {
        if route.kind.is_direct() {
            return None;
        }
        self.credentials.clone()
    }
}

/// Per-route credential cache in front of a provider.
///
/// Lives for one proxy session; the session's stop hook resets it so a
/// credential change takes effect on the next start.
pub struct CredentialsStore {
    provider: Arc<dyn CredentialsProvider>,
    cache: DashMap<ProxyRoute, Option<Credentials>>,
}

impl CredentialsStore {
    pub fn new(provider: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
        }
    }

    pub fn get(&self, route: &ProxyRoute) -> Option<Credentials> {
        if let Some(cached) = self.cache.get(route) {
            return cached.clone();
        }
        let resolved = self.provider.credentials_for(route);
        self.cache.insert(route.clone(), resolved.clone());
        resolved
    }

    pub fn reset(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteKind;

    #[test]
    fn test_bare_username_strips_domain() {
        let plain = Credentials::new("alice", "s3cret");
        assert_eq!(plain.bare_username(), "alice");

        let domained = Credentials::new("CORP\\alice", "s3cret");
        assert_eq!(domained.bare_username(), "alice");
    }

    #[test]
    fn test_basic_token_encoding() {
        let creds = Credentials::new("user", "pass");
        assert_eq!(creds.basic_token(), BASE64.encode("user:pass"));
    }

    #[test]
    fn test_static_provider_skips_direct_routes() {
        let provider = StaticCredentials::new(Some("user".into()), Some("pass".into()));

        assert!(provider.credentials_for(&ProxyRoute::direct()).is_none());
        let http = ProxyRoute::new(RouteKind::Http, "proxy", 3128);
        assert_eq!(
            provider.credentials_for(&http).unwrap(),
            Credentials::new("user", "pass")
        );
    }

    #[test]
    fn test_store_caches_and_resets() {
        let provider = Arc::new(StaticCredentials::new(Some("user".into()), None));
        let store = CredentialsStore::new(provider);
        let route = ProxyRoute::new(RouteKind::Socks5, "proxy", 1080);

        assert!(store.get(&route).is_some());
        assert!(!store.cache.is_empty());

        store.reset();
        assert!(store.cache.is_empty());
    }
}
