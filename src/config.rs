use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PorticoError, Result};
use crate::route::{ProxyRoute, RouteKind};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Facade and upstream routing configuration
    pub proxy: ProxyConfig,
    /// PAC evaluation configuration
    pub pac: PacConfig,
    /// Buffering, spooling and socket tuning
    pub system: SystemConfig,
    /// Logging configuration
    pub log: LogConfig,
}

/// How the upstream route for a request is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Connect targets directly, no upstream proxy
    Direct,
    /// A single upstream HTTP proxy
    Http,
    /// A single upstream SOCKS4 proxy
    Socks4,
    /// A single upstream SOCKS5 proxy
    Socks5,
    /// Routes selected per request by a PAC script
    Pac,
}

impl ProxyMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "http" => Ok(Self::Http),
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            "pac" | "autoconfig" => Ok(Self::Pac),
            other => Err(PorticoError::InvalidConfig(format!(
                "Unknown proxy mode: {}",
                other
            ))),
        }
    }

    pub fn is_pac(&self) -> bool {
        matches!(self, Self::Pac)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Http => "http",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Pac => "pac",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the facade listener to (default: 127.0.0.1)
    pub local_host: String,
    /// Port for the facade listener (default: 3129)
    pub local_port: u16,
    /// Route selection mode
    pub mode: ProxyMode,
    /// Upstream proxy host, for manual proxied modes
    pub upstream_host: String,
    /// Upstream proxy port, for manual proxied modes
    pub upstream_port: u16,
    /// Upstream proxy credentials, if the route requires them
    pub username: Option<String>,
    pub password: Option<String>,
    /// Blacklist cooldown in minutes; <= 0 disables blacklisting
    pub blacklist_timeout_minutes: i64,
}

impl ProxyConfig {
    /// The single configured route, for manual (non-PAC) modes.
    pub fn manual_route(&self) -> Result<ProxyRoute> {
        let kind = match self.mode {
            ProxyMode::Direct => return Ok(ProxyRoute::direct()),
            ProxyMode::Http => RouteKind::Http,
            ProxyMode::Socks4 => RouteKind::Socks4,
            ProxyMode::Socks5 => RouteKind::Socks5,
            ProxyMode::Pac => {
                return Err(PorticoError::InvalidConfig(
                    "PAC mode has no manual route".into(),
                ))
            }
        };
        if self.upstream_host.is_empty() {
            return Err(PorticoError::InvalidConfig(
                "PROXY_UPSTREAM_HOST is required for manual proxy modes".into(),
            ));
        }
        Ok(ProxyRoute::new(
            kind,
            self.upstream_host.clone(),
            self.upstream_port,
        ))
    }

    pub fn blacklist_timeout(&self) -> Option<Duration> {
        if self.blacklist_timeout_minutes > 0 {
            Some(Duration::from_secs(
                self.blacklist_timeout_minutes as u64 * 60,
            ))
        } else {
            None
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

#[derive(Debug, Clone)]
pub struct PacConfig {
    /// PAC script location: a filesystem path or an http(s):// URL
    pub location: String,
    /// Number of pooled script engine workers
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Request bodies up to this many bytes are replayed from memory;
    /// larger or unknown-length bodies spill to a temp file
    pub internal_buffer_length: usize,
    /// Directory for spooled request bodies
    pub temp_directory: PathBuf,
    /// Timeout for dialing upstream proxies and targets
    pub connect_timeout: Duration,
    /// Timeout for reading a request or response head
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mode = ProxyMode::parse(&get_env_or("PROXY_MODE", "direct"))?;

        Ok(Config {
            proxy: ProxyConfig {
                local_host: get_env_or("PROXY_LOCAL_HOST", "127.0.0.1"),
                local_port: get_env_or("PROXY_LOCAL_PORT", "3129").parse().map_err(|_| {
                    PorticoError::InvalidConfig("PROXY_LOCAL_PORT must be a valid port".into())
                })?,
                mode,
                upstream_host: get_env_or("PROXY_UPSTREAM_HOST", ""),
                upstream_port: get_env_or("PROXY_UPSTREAM_PORT", "3128")
                    .parse()
                    .map_err(|_| {
                        PorticoError::InvalidConfig(
                            "PROXY_UPSTREAM_PORT must be a valid port".into(),
                        )
                    })?,
                username: env::var("PROXY_USERNAME").ok().filter(|s| !s.is_empty()),
                password: env::var("PROXY_PASSWORD").ok().filter(|s| !s.is_empty()),
                blacklist_timeout_minutes: get_env_or("PROXY_BLACKLIST_TIMEOUT_MINUTES", "30")
                    .parse()
                    .unwrap_or(30),
            },
            pac: PacConfig {
                location: get_env_or("PROXY_PAC_LOCATION", ""),
                pool_size: get_env_or("PAC_ENGINE_POOL_SIZE", "4").parse().unwrap_or(4),
            },
            system: SystemConfig {
                internal_buffer_length: get_env_or("PROXY_INTERNAL_BUFFER_LENGTH", "102400")
                    .parse()
                    .unwrap_or(102_400),
                temp_directory: env::var("PROXY_TEMP_DIRECTORY")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir()),
                connect_timeout: Duration::from_secs(
                    get_env_or("PROXY_CONNECT_TIMEOUT", "10").parse().unwrap_or(10),
                ),
                read_timeout: Duration::from_secs(
                    get_env_or("PROXY_READ_TIMEOUT", "60").parse().unwrap_or(60),
                ),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
