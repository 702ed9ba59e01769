//! A client's accepted connection
//!
//! Owns the accepted socket for exactly one request/response cycle (the
//! facade does not keep client connections alive), parses the inbound
//! proxy request, and provides the CRLF-framed write primitives the
//! processors commit responses with. Error responses are written before
//! the corresponding error propagates, so callers never need to repair
//! the wire state.

use std::time::SystemTime;

use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use super::body::RepeatableBody;
use super::wire::{self, RequestHead, ResponseHead};
use crate::config::Config;
use crate::error::{PorticoError, Result};

pub type ClientReader = BufReader<OwnedReadHalf>;
pub type ClientWriter = OwnedWriteHalf;

pub struct ClientConnection {
    reader: Option<ClientReader>,
    writer: Option<ClientWriter>,
    head: RequestHead,
    target: Url,
    is_connect: bool,
    body: Option<RepeatableBody>,
    committed: bool,
}

impl ClientConnection {
    /// Parse the request head off an accepted socket. A response is
    /// committed before any error is returned.
    pub async fn accept(stream: TcpStream, config: &Config) -> Result<ClientConnection> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let head = match timeout(
            config.system.read_timeout,
            wire::read_request_head(&mut reader),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                write_raw_error(&mut writer, Version::HTTP_11, e.status_code(), &e.to_string())
                    .await;
                return Err(e);
            }
            Err(_) => {
                write_raw_error(
                    &mut writer,
                    Version::HTTP_11,
                    StatusCode::REQUEST_TIMEOUT,
                    "timed out reading request",
                )
                .await;
                return Err(PorticoError::Timeout);
            }
        };

        let is_connect = head.method == Method::CONNECT;
        let target = match parse_request_url(is_connect, &head.uri) {
            Ok(target) => target,
            Err(e) => {
                write_raw_error(&mut writer, head.version, e.status_code(), &e.to_string()).await;
                return Err(e);
            }
        };

        debug!("Handle request: {} {}", head.method, head.uri);
        Ok(ClientConnection {
            reader: Some(reader),
            writer: Some(writer),
            head,
            target,
            is_connect,
            body: None,
            committed: false,
        })
    }

    /// Prepare a non-CONNECT request for forwarding: wrap the body so it
    /// can be replayed, drop hop-by-hop headers, and rewrite Via.
    pub fn prepare(&mut self, config: &Config) {
        if self.is_connect {
            return;
        }

        self.body = RepeatableBody::from_headers(
            &self.head.headers,
            config.system.internal_buffer_length,
            config.system.temp_directory.clone(),
        );

        // The body carries the chunked flag now; the forwarder re-frames.
        if let Some(value) = self
            .head
            .headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        {
            self.head.headers.remove(http::header::TRANSFER_ENCODING);
            if let Some(stripped) = wire::strip_chunked(&value) {
                if let Ok(value) = stripped.parse() {
                    self.head
                        .headers
                        .insert(http::header::TRANSFER_ENCODING, value);
                }
            }
        }

        let banned: Vec<http::HeaderName> = self
            .head
            .headers
            .keys()
            .filter(|name| wire::is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in banned {
            debug!("Request header {} removed", name);
            self.head.headers.remove(name);
        }

        let existing_via = self
            .head
            .headers
            .get(http::header::VIA)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let via = wire::via_value(self.head.version, existing_via.as_deref());
        self.head.headers.remove(http::header::VIA);
        if let Ok(value) = via.parse() {
            self.head.headers.insert(http::header::VIA, value);
        }
    }

    pub fn is_connect(&self) -> bool {
        self.is_connect
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The raw request URI as the client sent it.
    pub fn raw_uri(&self) -> &str {
        &self.head.uri
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The absolute target of this request.
    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn target_host(&self) -> &str {
        self.target.host_str().unwrap_or_default()
    }

    pub fn target_port(&self) -> u16 {
        self.target.port_or_known_default().unwrap_or(80)
    }

    /// "host:port" for CONNECT lines.
    pub fn target_authority(&self) -> String {
        format!("{}:{}", self.target_host(), self.target_port())
    }

    pub fn body(&self) -> Option<&RepeatableBody> {
        self.body.as_ref()
    }

    /// Stream (or replay) the request body into `dst`.
    pub async fn send_body<W>(&mut self, dst: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Self { reader, body, .. } = self;
        let (Some(reader), Some(body)) = (reader.as_mut(), body.as_mut()) else {
            return Ok(());
        };
        body.write_to(reader, dst).await
    }

    /// Hand out both socket halves for a duplex relay. The connection is
    /// spent afterwards; only the relay touches the wire from here on.
    pub fn take_streams(&mut self) -> Option<(ClientReader, ClientWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => {
                self.committed = true;
                Some((reader, writer))
            }
            _ => None,
        }
    }

    /// Write a status line, marking the response committed.
    pub async fn write_status_line(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
    ) -> std::io::Result<()> {
        let version = self.head.version;
        let reason = reason
            .or_else(|| status.canonical_reason())
            .unwrap_or_default();
        let line = format!(
            "{} {} {}",
            wire::version_token(version),
            status.as_u16(),
            sanitize_reason(reason)
        );
        self.committed = true;
        let writer = self.writer_mut()?;
        wire::write_line(writer, &line).await
    }

    pub async fn write_header(&mut self, name: &str, value: &str) -> std::io::Result<()> {
        wire::write_header(self.writer_mut()?, name, value).await
    }

    pub async fn write_blank_line(&mut self) -> std::io::Result<()> {
        wire::write_blank_line(self.writer_mut()?).await
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer_mut()?.write_all(data).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer_mut()?.flush().await
    }

    /// Relay an upstream response head as-is: status line plus headers and
    /// the blank separator. Commits the response.
    pub async fn write_response_head(&mut self, head: &ResponseHead) -> std::io::Result<()> {
        self.write_status_line(head.status, Some(&head.reason)).await?;
        for (name, value) in &head.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            self.write_header(name.as_str(), &value).await?;
        }
        self.write_blank_line().await
    }

    /// Status line, Date header and a blank line. Commits the response and
    /// swallows write failures, since there is nothing left to salvage.
    pub async fn write_error_response(&mut self, status: StatusCode, reason: Option<&str>) {
        debug!(
            "Write error response: status = {} reason = [{}]",
            status,
            reason.unwrap_or_default()
        );
        let result: std::io::Result<()> = async {
            self.write_status_line(status, reason).await?;
            self.write_header("Date", &httpdate::fmt_http_date(SystemTime::now()))
                .await?;
            self.write_blank_line().await?;
            self.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("Error on writing error response: {}", e);
        }
    }

    pub async fn write_bad_gateway(&mut self, reason: &str) {
        self.write_error_response(StatusCode::BAD_GATEWAY, Some(reason))
            .await;
    }

    /// The 407 page for upstream-auth failures the client must resolve.
    pub async fn write_proxy_auth_required(&mut self) {
        let body = "<!DOCTYPE HTML>\n\
                    <html><head>\n\
                    <title>Proxy authentication failed</title>\n\
                    </head><body>\n\
                    Portico failed to log in to the remote proxy with the provided credentials\n\
                    </body></html>\n";
        let result: std::io::Result<()> = async {
            self.write_status_line(StatusCode::PROXY_AUTHENTICATION_REQUIRED, None)
                .await?;
            self.write_header("Date", &httpdate::fmt_http_date(SystemTime::now()))
                .await?;
            self.write_header("Content-Length", &body.len().to_string())
                .await?;
            self.write_blank_line().await?;
            self.write_bytes(body.as_bytes()).await?;
            self.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("Error on writing proxy auth required response: {}", e);
        }
    }

    fn writer_mut(&mut self) -> std::io::Result<&mut ClientWriter> {
        self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client socket already handed to a relay",
            )
        })
    }
}

impl std::fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.head.method, self.head.uri)
    }
}

/// The absolute target of a request: the CONNECT authority, or the
/// absolute-form URI of a plain proxy request.
fn parse_request_url(is_connect: bool, uri: &str) -> Result<Url> {
    if is_connect {
        let url = Url::parse(&format!("https://{}", uri))
            .map_err(|e| PorticoError::InvalidRequest(format!("bad CONNECT authority: {}", e)))?;
        if url.host_str().is_none() {
            return Err(PorticoError::InvalidRequest(
                "CONNECT authority without host".to_string(),
            ));
        }
        return Ok(url);
    }

    let url = Url::parse(uri)
        .map_err(|e| PorticoError::InvalidRequest(format!("bad request URI: {}", e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PorticoError::InvalidRequest(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(PorticoError::InvalidRequest(
            "request URI without host".to_string(),
        ));
    }
    Ok(url)
}

/// CR/LF in a reason phrase would break the status line.
fn sanitize_reason(reason: &str) -> String {
    reason.replace(['\r', '\n'], " ")
}

async fn write_raw_error(
    writer: &mut ClientWriter,
    version: Version,
    status: StatusCode,
    reason: &str,
) {
    let line = format!(
        "{} {} {}",
        wire::version_token(version),
        status.as_u16(),
        sanitize_reason(reason)
    );
    let result: std::io::Result<()> = async {
        wire::write_line(writer, &line).await?;
        wire::write_header(writer, "Date", &httpdate::fmt_http_date(SystemTime::now())).await?;
        wire::write_blank_line(writer).await?;
        writer.flush().await
    }
    .await;
    if let Err(e) = result {
        debug!("Error on writing error response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_target() {
        let url = parse_request_url(true, "example.com:8443").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port_or_known_default(), Some(8443));

        // No port falls back to the TLS default.
        let url = parse_request_url(true, "example.com").unwrap();
        assert_eq!(url.port_or_known_default(), Some(443));
    }

    #[test]
    fn test_parse_absolute_uri() {
        let url = parse_request_url(false, "http://example.com/index.html?q=1").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port_or_known_default(), Some(80));
        assert_eq!(url.path(), "/index.html");
    }

    #[test]
    fn test_origin_form_is_rejected() {
        assert!(parse_request_url(false, "/index.html").is_err());
        assert!(parse_request_url(false, "ftp://example.com/").is_err());
    }

    #[test]
    fn test_sanitize_reason_strips_crlf() {
        assert_eq!(sanitize_reason("a\r\nb"), "a  b");
    }
}
