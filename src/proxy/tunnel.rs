//! CONNECT tunnel establishment through an upstream HTTP proxy
//!
//! Sends the CONNECT line at the target, answers Basic proxy-auth
//! challenges, and hands back either the established tunnel stream or the
//! proxy's buffered rejection response for the caller to relay.

use bytes::Bytes;
use http::{StatusCode, Version};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::transport::RouteConnector;
use super::wire::{self, ResponseHead};
use crate::credentials::Credentials;
use crate::error::{PorticoError, Result};
use crate::route::ProxyRoute;

/// A misbehaving proxy must not keep us in a challenge loop forever.
const MAX_AUTH_ROUNDS: usize = 3;

/// Rejection bodies larger than this are truncated before relaying.
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// An established tunnel: the proxy's socket (with whatever the head
/// parser buffered) plus the final response head to relay to the client.
#[derive(Debug)]
pub struct Tunnel {
    pub stream: BufReader<TcpStream>,
    pub head: ResponseHead,
}

/// The proxy's non-2xx answer to the CONNECT, buffered for relaying.
#[derive(Debug)]
pub struct TunnelRefusal {
    pub head: ResponseHead,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum TunnelOutcome {
    Established(Tunnel),
    Refused(TunnelRefusal),
}

pub struct TunnelEstablisher {
    connector: RouteConnector,
}

impl TunnelEstablisher {
    pub fn new(connector: RouteConnector) -> Self {
        Self { connector }
    }

    /// Run the CONNECT handshake against `route` for `authority`
    /// ("host:port"). Dial errors bubble up for route-retry
    /// classification; an active refusal comes back as `Refused`.
    pub async fn open(
        &self,
        route: &ProxyRoute,
        authority: &str,
        version: Version,
        credentials: Option<&Credentials>,
    ) -> Result<TunnelOutcome> {
        let (proxy_host, proxy_port) = match (&route.host, route.port) {
            (Some(host), Some(port)) => (host.clone(), port),
            _ => {
                return Err(PorticoError::Internal(format!(
                    "CONNECT through routeless {}",
                    route
                )))
            }
        };

        let mut pending: Option<BufReader<TcpStream>> = None;
        let mut auth_token: Option<String> = None;
        let mut rounds = 0;

        loop {
            let mut conn = match pending.take() {
                Some(conn) => conn,
                None => BufReader::new(self.connector.dial(&proxy_host, proxy_port).await?),
            };

            wire::write_line(
                &mut conn,
                &format!("CONNECT {} {}", authority, wire::version_token(version)),
            )
            .await?;
            wire::write_header(&mut conn, "Host", authority).await?;
            if let Some(token) = &auth_token {
                wire::write_header(&mut conn, "Proxy-Authorization", &format!("Basic {}", token))
                    .await?;
            }
            wire::write_blank_line(&mut conn).await?;
            tokio::io::AsyncWriteExt::flush(&mut conn).await?;

            let head = wire::read_response_head(&mut conn).await?;
            debug!("Tunnel status code: {}", head.status);

            if head.status.as_u16() < 200 {
                return Err(PorticoError::Http(format!(
                    "Unexpected response to CONNECT request: {}",
                    head.status
                )));
            }

            let challenged = head.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
                && has_basic_challenge(&head);
            if challenged && auth_token.is_none() && rounds < MAX_AUTH_ROUNDS {
                if let Some(creds) = credentials {
                    rounds += 1;
                    debug!("Answering proxy auth challenge (round {})", rounds);
                    auth_token = Some(creds.basic_token());
                    // Reuse the connection when the proxy keeps it open.
                    if head.keep_alive() && drain_body(&mut conn, &head).await.is_ok() {
                        pending = Some(conn);
                    } else {
                        debug!("Proxy closed the challenge connection, reconnecting");
                    }
                    continue;
                }
            }

            if head.status.is_success() {
                return Ok(TunnelOutcome::Established(Tunnel { stream: conn, head }));
            }

            let body = read_rejection_body(&mut conn, &head).await.unwrap_or_default();
            return Ok(TunnelOutcome::Refused(TunnelRefusal { head, body }));
        }
    }
}

fn has_basic_challenge(head: &ResponseHead) -> bool {
    head.headers
        .get_all(http::header::PROXY_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.trim_start().to_ascii_lowercase().starts_with("basic"))
}

/// Consume the challenge response's body so the connection can carry the
/// next CONNECT attempt. Only declared-length bodies are drainable.
async fn drain_body(conn: &mut BufReader<TcpStream>, head: &ResponseHead) -> std::io::Result<()> {
    let length = head.content_length().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "challenge body without a declared length",
        )
    })?;
    let mut remaining = length;
    let mut buffer = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = conn.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Buffer a rejection's body (declared length, chunked, or until EOF).
async fn read_rejection_body(
    conn: &mut BufReader<TcpStream>,
    head: &ResponseHead,
) -> std::io::Result<Bytes> {
    let mut body = Vec::new();
    if head.is_chunked() {
        while let Some(size) = wire::read_chunk_size(conn).await? {
            let mut data = vec![0u8; size.min(MAX_REJECTION_BODY)];
            conn.read_exact(&mut data).await?;
            if body.len() < MAX_REJECTION_BODY {
                body.extend_from_slice(&data);
            }
            wire::read_chunk_terminator(conn).await?;
        }
    } else if let Some(length) = head.content_length() {
        let mut remaining = length.min(MAX_REJECTION_BODY as u64);
        let mut buffer = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = conn.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buffer[..n]);
            remaining -= n as u64;
        }
    } else if !head.keep_alive() {
        let mut limited = conn.take(MAX_REJECTION_BODY as u64);
        limited.read_to_end(&mut body).await?;
    }
    Ok(Bytes::from(body))
}
