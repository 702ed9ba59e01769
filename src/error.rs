use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Portico facade
#[derive(Error, Debug)]
pub enum PorticoError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Client request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Upstream route errors
    #[error("Route connect failed: {0}")]
    RouteConnect(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Unresolved host: {0}")]
    UnresolvedHost(String),

    #[error("No upstream route available")]
    NoRouteAvailable,

    // Tunnel errors
    #[error("CONNECT refused by proxy: {0}")]
    TunnelRefused(String),

    #[error("Proxy authentication failed")]
    ProxyAuthFailed,

    #[error("SOCKS error: {0}")]
    Socks(String),

    // PAC errors
    #[error("PAC file error: {0}")]
    PacFile(String),

    #[error("PAC script error: {0}")]
    PacScript(String),

    // Session lifecycle
    #[error("Proxy session already started")]
    AlreadyStarted,

    // Timeouts and I/O
    #[error("Operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Portico operations
pub type Result<T> = std::result::Result<T, PorticoError>;

impl PorticoError {
    /// Get the HTTP status code reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PorticoError::InvalidRequest(_)
            | PorticoError::InvalidConfig(_)
            | PorticoError::MissingEnvVar(_) => StatusCode::BAD_REQUEST,

            PorticoError::UnresolvedHost(_) => StatusCode::NOT_FOUND,

            PorticoError::ProxyAuthFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            PorticoError::Timeout | PorticoError::TargetUnreachable(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }

            PorticoError::RouteConnect(_)
            | PorticoError::NoRouteAvailable
            | PorticoError::TunnelRefused(_)
            | PorticoError::PacScript(_) => StatusCode::BAD_GATEWAY,

            PorticoError::PacFile(_)
            | PorticoError::Socks(_)
            | PorticoError::AlreadyStarted
            | PorticoError::Io(_)
            | PorticoError::Http(_)
            | PorticoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The reason phrase reported to the client for PAC evaluation failures.
    ///
    /// The categories stay distinct so a user can tell a broken or missing
    /// PAC file apart from a script that failed at call time.
    pub fn pac_reason_phrase(&self) -> Option<&'static str> {
        match self {
            PorticoError::PacFile(_) => Some("Proxy Auto Config javascript file: syntax error"),
            PorticoError::PacScript(_) => {
                Some("Proxy Auto Config javascript file: content not acceptable")
            }
            PorticoError::Io(_) => Some("Proxy Auto Config javascript file: not found"),
            _ => None,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// Retryable connect failure against an upstream route.
///
/// This is the signal that makes the route-iteration loop advance to the
/// next candidate (blacklisting the failed one in PAC mode). Every other
/// failure commits a response instead.
#[derive(Error, Debug)]
#[error("Failed to connect to route: {message}")]
pub struct RouteConnectError {
    pub message: String,
}

impl RouteConnectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Whether an I/O error means the peer could not be reached at all
/// (refused or timed out), as opposed to failing mid-conversation.
pub fn is_connect_failure(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
    )
}

/// Whether an I/O error came from hostname resolution.
pub fn is_resolve_failure(e: &std::io::Error) -> bool {
    // getaddrinfo failures have no dedicated ErrorKind; match the
    // resolver messages instead.
    if e.kind() == std::io::ErrorKind::NotFound {
        return true;
    }
    let text = e.to_string();
    text.contains("failed to lookup address")
        || text.contains("Name or service not known")
        || text.contains("nodename nor servname")
}
