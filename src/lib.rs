//! Portico - Local Forward-Proxy Facade
//!
//! A local proxy that insulates clients which only understand "no proxy"
//! from environments that require authenticated upstream proxies or
//! PAC-script-driven routing.
//!
//! ## Features
//!
//! - Manual upstream routing: DIRECT, HTTP, SOCKS4 and SOCKS5 proxies
//! - Per-request route selection from a Proxy-Auto-Config (PAC) script,
//!   evaluated in a sandboxed, pooled JavaScript engine
//! - Ordered route fallback with time-windowed blacklisting
//! - CONNECT tunnelling with upstream proxy-authentication handling
//! - Replayable request bodies (memory or spooled temp file) so a request
//!   survives retrying against a second candidate route

pub mod blacklist;
pub mod config;
pub mod credentials;
pub mod error;
pub mod pac;
pub mod proxy;
pub mod route;

pub use blacklist::RouteBlacklist;
pub use config::Config;
pub use error::{PorticoError, Result};
pub use pac::PacEvaluator;
pub use proxy::ProxySession;
pub use route::{ProxyRoute, RouteKind};
