//! Per-route stream dialing
//!
//! Opens the raw TCP stream a route uses to reach a target: DIRECT dials
//! the target itself, SOCKS4/SOCKS5 tunnel through the configured proxy,
//! and HTTP dials the proxy (the target is then named at the HTTP layer,
//! by a CONNECT line or an absolute-form request).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::{is_resolve_failure, PorticoError, Result};
use crate::route::{ProxyRoute, RouteKind};

/// Dials upstream streams with the configured connect timeout.
#[derive(Clone)]
pub struct RouteConnector {
    connect_timeout: Duration,
}

impl RouteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open the stream over which `target_host:target_port` is reached
    /// through `route`. Credentials apply to SOCKS5 handshakes; HTTP
    /// proxy authentication happens at the HTTP layer, not here.
    pub async fn connect(
        &self,
        route: &ProxyRoute,
        target_host: &str,
        target_port: u16,
        credentials: Option<&Credentials>,
    ) -> Result<TcpStream> {
        match route.kind {
            RouteKind::Direct => {
                debug!("Dialing target {}:{} directly", target_host, target_port);
                self.dial(target_host, target_port).await
            }
            RouteKind::Http => {
                let (host, port) = route_endpoint(route)?;
                debug!("Dialing HTTP proxy {}:{}", host, port);
                self.dial(&host, port).await
            }
            RouteKind::Socks4 => {
                let (host, port) = route_endpoint(route)?;
                debug!(
                    "Dialing {}:{} through SOCKS4 proxy {}:{}",
                    target_host, target_port, host, port
                );
                let proxy_addr = format!("{}:{}", host, port);
                let stream = timeout(
                    self.connect_timeout,
                    Socks4Stream::connect(proxy_addr.as_str(), (target_host, target_port)),
                )
                .await
                .map_err(|_| PorticoError::Timeout)?
                .map_err(map_socks_error)?;
                Ok(stream.into_inner())
            }
            RouteKind::Socks5 => {
                let (host, port) = route_endpoint(route)?;
                debug!(
                    "Dialing {}:{} through SOCKS5 proxy {}:{}",
                    target_host, target_port, host, port
                );
                let proxy_addr = format!("{}:{}", host, port);
                let stream = match credentials {
                    Some(creds) => {
                        timeout(
                            self.connect_timeout,
                            Socks5Stream::connect_with_password(
                                proxy_addr.as_str(),
                                (target_host, target_port),
                                creds.bare_username(),
                                &creds.password,
                            ),
                        )
                        .await
                    }
                    None => {
                        timeout(
                            self.connect_timeout,
                            Socks5Stream::connect(proxy_addr.as_str(), (target_host, target_port)),
                        )
                        .await
                    }
                }
                .map_err(|_| PorticoError::Timeout)?
                .map_err(map_socks_error)?;
                Ok(stream.into_inner())
            }
        }
    }

    /// Plain TCP dial with timeout; resolver failures are surfaced as
    /// UnresolvedHost so processors can classify them.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| PorticoError::Timeout)?
            .map_err(|e| {
                if is_resolve_failure(&e) {
                    PorticoError::UnresolvedHost(host.to_string())
                } else {
                    PorticoError::Io(e)
                }
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn route_endpoint(route: &ProxyRoute) -> Result<(String, u16)> {
    match (&route.host, route.port) {
        (Some(host), Some(port)) => Ok((host.clone(), port)),
        _ => Err(PorticoError::Internal(format!(
            "route {} has no endpoint",
            route
        ))),
    }
}

fn map_socks_error(e: tokio_socks::Error) -> PorticoError {
    use tokio_socks::Error;
    match e {
        Error::Io(io) => {
            if is_resolve_failure(&io) {
                PorticoError::UnresolvedHost(io.to_string())
            } else {
                PorticoError::Io(io)
            }
        }
        Error::PasswordAuthFailure(_) | Error::NoAcceptableAuthMethods => {
            PorticoError::ProxyAuthFailed
        }
        Error::ConnectionRefused => PorticoError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused through SOCKS proxy",
        )),
        Error::HostUnreachable | Error::NetworkUnreachable | Error::TtlExpired => {
            PorticoError::TargetUnreachable(e.to_string())
        }
        other => PorticoError::Socks(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn connector() -> RouteConnector {
        RouteConnector::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_direct_route_dials_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut stream = connector()
            .connect(&ProxyRoute::direct(), "127.0.0.1", addr.port(), None)
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_route_dials_the_proxy_not_the_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"proxy").await.unwrap();
        });

        let route = ProxyRoute::new(RouteKind::Http, "127.0.0.1", addr.port());
        // Target host is irrelevant for the dial.
        let mut stream = connector()
            .connect(&route, "unreachable.invalid", 80, None)
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"proxy");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_surfaces_io_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector()
            .connect(&ProxyRoute::direct(), "127.0.0.1", port, None)
            .await
            .unwrap_err();
        match err {
            PorticoError::Io(io) => {
                assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("expected Io error, got {:?}", other),
        }
    }
}
