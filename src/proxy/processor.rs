//! The four connection-processing strategies
//!
//! One processor executes one attempt of one request against one route.
//! Selection is a 2x2 lookup on (is CONNECT, is HTTP route): CONNECT
//! tunnels either through an upstream HTTP proxy or over a raw
//! SOCKS/direct stream; non-CONNECT requests are forwarded and their
//! response relayed. `handle_error` decides between committing an error
//! response and signalling the route-iteration loop to try the next
//! candidate.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::client::ClientConnection;
use super::relay;
use super::transport::RouteConnector;
use super::tunnel::{TunnelEstablisher, TunnelOutcome};
use super::wire;
use crate::credentials::CredentialsStore;
use crate::error::{is_connect_failure, PorticoError, Result, RouteConnectError};
use crate::route::ProxyRoute;

/// One attempt of one request against one route.
#[async_trait]
pub trait ConnectionProcessor: Send + Sync {
    /// Execute the attempt. Must not commit a response unless it returns
    /// normally (streaming the successful response counts as returning
    /// normally even if the wire breaks mid-body).
    async fn handle_request(&self, conn: &mut ClientConnection, route: &ProxyRoute) -> Result<()>;

    /// Classify a failed attempt: either commit an error response, or
    /// return the retry signal for the route-iteration loop.
    async fn handle_error(
        &self,
        conn: &mut ClientConnection,
        route: &ProxyRoute,
        error: PorticoError,
    ) -> std::result::Result<(), RouteConnectError>;

    /// Run the attempt, routing failures through `handle_error`. Failures
    /// after the status line is committed are only logged; the connection
    /// is torn down by the caller.
    async fn process(
        &self,
        conn: &mut ClientConnection,
        route: &ProxyRoute,
    ) -> std::result::Result<(), RouteConnectError> {
        debug!("Process {} for route {}", conn, route);
        match self.handle_request(conn, route).await {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!("Error on handling request: {}", error);
                if conn.is_committed() {
                    debug!("Response already committed, nothing to repair");
                    return Ok(());
                }
                self.handle_error(conn, route, error).await
            }
        }
    }
}

/// The strategy table, selected by (is_connect, is_http_route).
pub struct ProcessorSet {
    http_connect: HttpTunnelProcessor,
    socks_connect: SocksConnectProcessor,
    http_forward: HttpForwardProcessor,
    socks_forward: SocksForwardProcessor,
}

impl ProcessorSet {
    pub fn new(connector: RouteConnector, credentials: Arc<CredentialsStore>) -> Self {
        Self {
            http_connect: HttpTunnelProcessor {
                establisher: TunnelEstablisher::new(connector.clone()),
                credentials: credentials.clone(),
            },
            socks_connect: SocksConnectProcessor {
                connector: connector.clone(),
                credentials: credentials.clone(),
            },
            http_forward: HttpForwardProcessor {
                connector: connector.clone(),
                credentials: credentials.clone(),
            },
            socks_forward: SocksForwardProcessor {
                connector,
                credentials,
            },
        }
    }

    pub fn select(&self, is_connect: bool, is_http_route: bool) -> &dyn ConnectionProcessor {
        match (is_connect, is_http_route) {
            (true, true) => &self.http_connect,
            (true, false) => &self.socks_connect,
            (false, true) => &self.http_forward,
            (false, false) => &self.socks_forward,
        }
    }
}

/// CONNECT through an upstream HTTP proxy: establish the tunnel, relay the
/// proxy's answer, then go full duplex.
struct HttpTunnelProcessor {
    establisher: TunnelEstablisher,
    credentials: Arc<CredentialsStore>,
}

#[async_trait]
impl ConnectionProcessor for HttpTunnelProcessor {
    async fn handle_request(&self, conn: &mut ClientConnection, route: &ProxyRoute) -> Result<()> {
        let credentials = self.credentials.get(route);
        let authority = conn.target_authority();
        let outcome = self
            .establisher
            .open(route, &authority, conn.version(), credentials.as_ref())
            .await?;

        match outcome {
            TunnelOutcome::Established(tunnel) => {
                let write_result: std::io::Result<()> = async {
                    conn.write_response_head(&tunnel.head).await?;
                    conn.flush().await
                }
                .await;
                if let Err(e) = write_result {
                    debug!("Error on handling CONNECT response: {}", e);
                    return Ok(());
                }
                if let Some(streams) = conn.take_streams() {
                    relay::relay_stream(streams, tunnel.stream).await;
                }
                Ok(())
            }
            TunnelOutcome::Refused(refusal) => {
                debug!("The tunnel request was rejected by the proxy");
                // The refusal body was de-chunked while buffering, so its
                // framing headers are re-derived here.
                let mut head = refusal.head.clone();
                head.headers.remove(http::header::TRANSFER_ENCODING);
                if let Ok(value) = refusal.body.len().to_string().parse() {
                    head.headers.insert(http::header::CONTENT_LENGTH, value);
                }
                let write_result: std::io::Result<()> = async {
                    conn.write_response_head(&head).await?;
                    conn.write_bytes(&refusal.body).await?;
                    conn.flush().await
                }
                .await;
                if let Err(e) = write_result {
                    debug!("Error on writing tunnel refusal: {}", e);
                }
                Ok(())
            }
        }
    }

    async fn handle_error(
        &self,
        conn: &mut ClientConnection,
        _route: &ProxyRoute,
        error: PorticoError,
    ) -> std::result::Result<(), RouteConnectError> {
        match error {
            PorticoError::Io(e) if is_connect_failure(&e) => {
                Err(RouteConnectError::new(e.to_string()))
            }
            PorticoError::Timeout => Err(RouteConnectError::new("connect timed out")),
            PorticoError::UnresolvedHost(host) => {
                Err(RouteConnectError::new(format!("unresolved host: {}", host)))
            }
            PorticoError::Http(message) => {
                // The proxy accepted the connection but never answered
                // usefully.
                conn.write_error_response(StatusCode::GATEWAY_TIMEOUT, Some(&message))
                    .await;
                Ok(())
            }
            other => {
                conn.write_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(&other.to_string()),
                )
                .await;
                Ok(())
            }
        }
    }
}

/// CONNECT over a SOCKS route or straight to the target: open the stream,
/// fake the 200, go full duplex.
struct SocksConnectProcessor {
    connector: RouteConnector,
    credentials: Arc<CredentialsStore>,
}

#[async_trait]
impl ConnectionProcessor for SocksConnectProcessor {
    async fn handle_request(&self, conn: &mut ClientConnection, route: &ProxyRoute) -> Result<()> {
        let credentials = self.credentials.get(route);
        let target_host = conn.target_host().to_string();
        let target_port = conn.target_port();
        let upstream = self
            .connector
            .connect(route, &target_host, target_port, credentials.as_ref())
            .await?;
        debug!("Connected to {}:{}", target_host, target_port);

        let write_result: std::io::Result<()> = async {
            conn.write_status_line(StatusCode::OK, Some("Connection established"))
                .await?;
            conn.write_header("Date", &httpdate::fmt_http_date(SystemTime::now()))
                .await?;
            conn.write_blank_line().await?;
            conn.flush().await
        }
        .await;
        if let Err(e) = write_result {
            debug!("Error on writing CONNECT response: {}", e);
            return Ok(());
        }

        if let Some(streams) = conn.take_streams() {
            relay::relay_stream(streams, upstream).await;
        }
        Ok(())
    }

    async fn handle_error(
        &self,
        conn: &mut ClientConnection,
        _route: &ProxyRoute,
        error: PorticoError,
    ) -> std::result::Result<(), RouteConnectError> {
        match error {
            PorticoError::UnresolvedHost(host) => {
                conn.write_error_response(StatusCode::NOT_FOUND, Some(&host)).await;
                Ok(())
            }
            PorticoError::Timeout | PorticoError::TargetUnreachable(_) => {
                conn.write_error_response(StatusCode::GATEWAY_TIMEOUT, Some(&error.to_string()))
                    .await;
                Ok(())
            }
            PorticoError::ProxyAuthFailed => {
                conn.write_proxy_auth_required().await;
                Ok(())
            }
            PorticoError::Io(e) if is_connect_failure(&e) => {
                Err(RouteConnectError::new(e.to_string()))
            }
            other => {
                conn.write_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(&other.to_string()),
                )
                .await;
                Ok(())
            }
        }
    }
}

/// Non-CONNECT forwarding through an upstream HTTP proxy.
struct HttpForwardProcessor {
    connector: RouteConnector,
    credentials: Arc<CredentialsStore>,
}

#[async_trait]
impl ConnectionProcessor for HttpForwardProcessor {
    async fn handle_request(&self, conn: &mut ClientConnection, route: &ProxyRoute) -> Result<()> {
        forward_request(conn, route, &self.connector, &self.credentials).await
    }

    async fn handle_error(
        &self,
        conn: &mut ClientConnection,
        _route: &ProxyRoute,
        error: PorticoError,
    ) -> std::result::Result<(), RouteConnectError> {
        match error {
            PorticoError::Io(e) if is_connect_failure(&e) => {
                Err(RouteConnectError::new(e.to_string()))
            }
            // The connector only dials the proxy here, so a timeout or an
            // unresolved name is the route's failure, not the target's.
            PorticoError::Timeout => Err(RouteConnectError::new("connect timed out")),
            PorticoError::UnresolvedHost(host) => {
                Err(RouteConnectError::new(format!("unresolved host: {}", host)))
            }
            PorticoError::TargetUnreachable(message) => {
                conn.write_error_response(StatusCode::GATEWAY_TIMEOUT, Some(&message))
                    .await;
                Ok(())
            }
            other => {
                conn.write_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(&other.to_string()),
                )
                .await;
                Ok(())
            }
        }
    }
}

/// Non-CONNECT forwarding over a SOCKS or direct stream; same wire work as
/// the HTTP variant, SOCKS-specific error classification.
struct SocksForwardProcessor {
    connector: RouteConnector,
    credentials: Arc<CredentialsStore>,
}

#[async_trait]
impl ConnectionProcessor for SocksForwardProcessor {
    async fn handle_request(&self, conn: &mut ClientConnection, route: &ProxyRoute) -> Result<()> {
        forward_request(conn, route, &self.connector, &self.credentials).await
    }

    async fn handle_error(
        &self,
        conn: &mut ClientConnection,
        _route: &ProxyRoute,
        error: PorticoError,
    ) -> std::result::Result<(), RouteConnectError> {
        match error {
            PorticoError::UnresolvedHost(host) => {
                conn.write_error_response(StatusCode::NOT_FOUND, Some(&host)).await;
                Ok(())
            }
            PorticoError::ProxyAuthFailed => {
                conn.write_proxy_auth_required().await;
                Ok(())
            }
            PorticoError::Io(e) if is_connect_failure(&e) => {
                Err(RouteConnectError::new(e.to_string()))
            }
            PorticoError::Timeout | PorticoError::TargetUnreachable(_) => {
                conn.write_error_response(StatusCode::GATEWAY_TIMEOUT, Some(&error.to_string()))
                    .await;
                Ok(())
            }
            other => {
                conn.write_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(&other.to_string()),
                )
                .await;
                Ok(())
            }
        }
    }
}

/// Issue the client's request through `route` and relay the response.
async fn forward_request(
    conn: &mut ClientConnection,
    route: &ProxyRoute,
    connector: &RouteConnector,
    credentials: &CredentialsStore,
) -> Result<()> {
    let credentials = credentials.get(route);
    let target_host = conn.target_host().to_string();
    let target_port = conn.target_port();

    let stream = connector
        .connect(route, &target_host, target_port, credentials.as_ref())
        .await?;
    let mut upstream = BufReader::new(stream);

    // HTTP proxies get the absolute form the client sent; everything else
    // gets the origin form.
    let request_uri = if route.kind.is_http() {
        conn.raw_uri().to_string()
    } else {
        origin_form(conn.target())
    };

    let mut headers = conn.headers().clone();
    if !headers.contains_key(http::header::HOST) {
        if let Ok(value) = host_header_value(conn.target()).parse() {
            headers.insert(http::header::HOST, value);
        }
    }
    if route.kind.is_http() {
        if let Some(creds) = &credentials {
            if let Ok(value) = format!("Basic {}", creds.basic_token()).parse() {
                headers.insert(http::header::PROXY_AUTHORIZATION, value);
            }
        }
    }
    if conn.body().map(|body| body.is_chunked()).unwrap_or(false) {
        // Appended, so a surviving "gzip" coding keeps chunked last.
        headers.append(
            http::header::TRANSFER_ENCODING,
            http::HeaderValue::from_static("chunked"),
        );
    }
    // One request per upstream connection, so the response may be
    // EOF-delimited.
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("close"),
    );

    wire::write_request_head(
        &mut upstream,
        conn.method(),
        &request_uri,
        conn.version(),
        &headers,
    )
    .await?;
    conn.send_body(&mut upstream).await?;
    upstream.flush().await?;

    let head = wire::read_response_head(&mut upstream).await?;
    relay_response(conn, &mut upstream, &head).await
}

/// Relay an upstream response to the client: rewrite Via, drop the
/// proxy-auth challenge, strip `chunked` (the body is de-chunked on the
/// way through and EOF-delimited toward the client).
async fn relay_response(
    conn: &mut ClientConnection,
    upstream: &mut BufReader<tokio::net::TcpStream>,
    head: &wire::ResponseHead,
) -> Result<()> {
    conn.write_status_line(head.status, Some(&head.reason)).await?;

    let existing_via = head
        .headers
        .get(http::header::VIA)
        .and_then(|v| v.to_str().ok());
    conn.write_header("Via", &wire::via_value(conn.version(), existing_via))
        .await?;

    for (name, value) in &head.headers {
        if name == http::header::VIA || name == http::header::PROXY_AUTHENTICATE {
            continue;
        }
        if name == http::header::TRANSFER_ENCODING {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if let Some(stripped) = wire::strip_chunked(&value) {
                conn.write_header(name.as_str(), &stripped).await?;
            }
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        conn.write_header(name.as_str(), &value).await?;
    }
    conn.write_blank_line().await?;

    let mut buffer = [0u8; 8 * 1024];
    if head.is_chunked() {
        while let Some(size) = wire::read_chunk_size(upstream).await? {
            let mut remaining = size;
            while remaining > 0 {
                let want = remaining.min(buffer.len());
                let n = upstream.read(&mut buffer[..want]).await?;
                if n == 0 {
                    return Err(PorticoError::Http("truncated chunked body".to_string()));
                }
                conn.write_bytes(&buffer[..n]).await?;
                remaining -= n;
            }
            wire::read_chunk_terminator(upstream).await?;
        }
    } else if let Some(length) = head.content_length() {
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = upstream.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            conn.write_bytes(&buffer[..n]).await?;
            remaining -= n as u64;
        }
    } else {
        loop {
            let n = upstream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            conn.write_bytes(&buffer[..n]).await?;
        }
    }
    conn.flush().await?;
    Ok(())
}

fn origin_form(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header_value(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LogConfig, PacConfig, ProxyConfig, ProxyMode, SystemConfig};
    use crate::credentials::StaticCredentials;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> Config {
        Config {
            proxy: ProxyConfig {
                local_host: "127.0.0.1".to_string(),
                local_port: 0,
                mode: ProxyMode::Direct,
                upstream_host: String::new(),
                upstream_port: 0,
                username: None,
                password: None,
                blacklist_timeout_minutes: 30,
            },
            pac: PacConfig {
                location: String::new(),
                pool_size: 1,
            },
            system: SystemConfig {
                internal_buffer_length: 1024,
                temp_directory: std::env::temp_dir(),
                connect_timeout: Duration::from_secs(2),
                read_timeout: Duration::from_secs(5),
            },
            log: LogConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    fn processors() -> ProcessorSet {
        let connector = RouteConnector::new(Duration::from_secs(2));
        let credentials = Arc::new(CredentialsStore::new(Arc::new(StaticCredentials::none())));
        ProcessorSet::new(connector, credentials)
    }

    /// Feed one raw request into a socket pair and return the accepted,
    /// prepared connection plus the client end.
    async fn connection_for(raw: &str) -> (ClientConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(raw.as_bytes()).await.unwrap();

        let (accepted, _) = listener.accept().await.unwrap();
        let config = test_config();
        let mut conn = ClientConnection::accept(accepted, &config).await.unwrap();
        conn.prepare(&config);
        (conn, client)
    }

    #[tokio::test]
    async fn test_direct_connect_roundtrip() {
        // Echo target the CONNECT should reach.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let raw = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
            target_addr.port()
        );
        let (mut conn, mut client) = connection_for(&raw).await;

        let process = tokio::spawn(async move {
            let set = processors();
            set.select(true, false)
                .process(&mut conn, &ProxyRoute::direct())
                .await
                .is_ok()
        });

        let mut reader = tokio::io::BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("HTTP/1.1 200"));
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).await.unwrap();
            if header.trim_end().is_empty() {
                break;
            }
        }

        // Tunnel is live: write through it and read the echo.
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        assert!(process.await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_forward_roundtrip() {
        // Minimal origin server.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = origin.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("GET /hello HTTP/1.1"));
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.unwrap();
                if header.trim_end().is_empty() {
                    break;
                }
            }
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld")
                .await
                .unwrap();
        });

        let raw = format!(
            "GET http://127.0.0.1:{}/hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        let (mut conn, mut client) = connection_for(&raw).await;

        let set = processors();
        set.select(false, false)
            .process(&mut conn, &ProxyRoute::direct())
            .await
            .unwrap();
        // Close the facade side so the client sees EOF.
        drop(conn);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Via: 1.1 portico\r\n"));
        assert!(response.ends_with("world"));
    }

    #[tokio::test]
    async fn test_dead_route_yields_retry_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let raw = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (mut conn, _client) = connection_for(raw).await;

        let set = processors();
        let route = ProxyRoute::new(crate::route::RouteKind::Http, "127.0.0.1", dead_port);
        let result = set.select(false, true).process(&mut conn, &route).await;
        assert!(result.is_err());
        assert!(!conn.is_committed());
    }
}
