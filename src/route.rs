//! Upstream route model and PAC directive-line parsing
//!
//! A route is a resolved upstream path for one request: DIRECT, or an
//! HTTP/SOCKS proxy with host:port.

use serde::Serialize;

use crate::error::{PorticoError, Result};

/// The kind of an upstream route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Direct,
    Http,
    Socks4,
    Socks5,
}

impl RouteKind {
    pub fn is_http(&self) -> bool {
        matches!(self, RouteKind::Http)
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, RouteKind::Socks4 | RouteKind::Socks5)
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, RouteKind::Direct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Direct => "direct",
            RouteKind::Http => "http",
            RouteKind::Socks4 => "socks4",
            RouteKind::Socks5 => "socks5",
        }
    }
}

/// An immutable upstream route: kind plus host:port for proxied kinds.
///
/// Equality and hashing cover the kind and the host:port pair, so the same
/// proxy parsed from two PAC lines collapses to one blacklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyRoute {
    pub kind: RouteKind,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ProxyRoute {
    pub fn direct() -> Self {
        Self {
            kind: RouteKind::Direct,
            host: None,
            port: None,
        }
    }

    pub fn new(kind: RouteKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// The proxy endpoint as "host:port"; None for DIRECT routes.
    pub fn addr(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr() {
            Some(addr) => write!(f, "{} {}", self.kind.as_str(), addr),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

/// Parse a PAC result line into an ordered route list.
///
/// The line is a `;`-separated sequence of directives, each `TYPE host:port`
/// or bare `DIRECT`. A blank line means DIRECT. Routes rejected by `keep`
/// (blacklisted ones) are dropped while preserving the order of the rest;
/// DIRECT is never filtered. Any malformed directive fails the whole call.
pub fn parse_proxy_line<F>(line: &str, keep: F) -> Result<Vec<ProxyRoute>>
where
    F: Fn(&ProxyRoute) -> bool,
{
    if line.trim().is_empty() {
        return Ok(vec![ProxyRoute::direct()]);
    }

    let mut routes = Vec::new();
    for directive in line.split(';') {
        let directive = directive.trim();
        if directive.is_empty() {
            continue;
        }

        let mut tokens = directive.split_whitespace();
        let kind_token = tokens.next().unwrap_or_default().to_ascii_uppercase();

        let kind = match kind_token.as_str() {
            "DIRECT" => {
                routes.push(ProxyRoute::direct());
                continue;
            }
            // HTTPS here means "proxy speaking CONNECT", same as PROXY
            "PROXY" | "HTTP" | "HTTPS" => RouteKind::Http,
            "SOCKS" | "SOCKS5" => RouteKind::Socks5,
            "SOCKS4" => RouteKind::Socks4,
            other => {
                return Err(PorticoError::InvalidRequest(format!(
                    "Invalid proxy line [{}]: unknown directive {}",
                    line, other
                )))
            }
        };

        let endpoint = tokens.next().ok_or_else(|| {
            PorticoError::InvalidRequest(format!(
                "Invalid proxy line [{}]: proxy host:port required",
                line
            ))
        })?;

        let (host, port) = parse_endpoint(endpoint).ok_or_else(|| {
            PorticoError::InvalidRequest(format!(
                "Invalid proxy line [{}]: bad endpoint {}",
                line, endpoint
            ))
        })?;

        let route = ProxyRoute::new(kind, host, port);
        if keep(&route) {
            routes.push(route);
        } else {
            tracing::debug!("Ignore blacklisted route {}", route);
        }
    }

    Ok(routes)
}

/// Split "host:port" (port defaults to 80 when absent, matching how HTTP
/// proxies are commonly listed in PAC files).
fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        Some(_) => None,
        None if !endpoint.is_empty() => Some((endpoint.to_string(), 80)),
        None => None,
    }
}
