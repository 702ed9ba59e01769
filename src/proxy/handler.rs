//! Per-connection request handling with route fallback
//!
//! This is the single place that decides between "advance to the next
//! candidate route" and "commit an error response". Manual mode has one
//! route and no fallback; PAC mode walks the evaluator's ordered candidate
//! list, blacklisting each route that fails to connect.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::client::ClientConnection;
use super::processor::ProcessorSet;
use super::transport::RouteConnector;
use crate::blacklist::RouteBlacklist;
use crate::config::Config;
use crate::credentials::CredentialsStore;
use crate::error::{PorticoError, Result};
use crate::pac::PacEvaluator;
use crate::route::ProxyRoute;

pub struct ClientHandler {
    config: Arc<Config>,
    blacklist: Arc<RouteBlacklist>,
    pac: Option<Arc<PacEvaluator>>,
    manual_route: Option<ProxyRoute>,
    processors: ProcessorSet,
}

impl ClientHandler {
    pub fn new(
        config: Arc<Config>,
        blacklist: Arc<RouteBlacklist>,
        pac: Option<Arc<PacEvaluator>>,
        credentials: Arc<CredentialsStore>,
    ) -> Result<Self> {
        let manual_route = if config.proxy.mode.is_pac() {
            None
        } else {
            Some(config.proxy.manual_route()?)
        };
        let connector = RouteConnector::new(config.system.connect_timeout);
        Ok(Self {
            config,
            blacklist,
            pac,
            manual_route,
            processors: ProcessorSet::new(connector, credentials),
        })
    }

    /// Run one accepted socket through parse, route resolution and the
    /// processing strategies. Whatever happens, a response (or a closed
    /// socket) is all the client ever sees; errors returned here are for
    /// logging only.
    #[instrument(skip(self, stream))]
    pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut conn = ClientConnection::accept(stream, &self.config).await?;
        conn.prepare(&self.config);

        match &self.pac {
            Some(pac) => self.process_with_pac(pac, &mut conn).await,
            None => self.process_manual(&mut conn).await,
        }
    }

    async fn process_with_pac(
        &self,
        pac: &PacEvaluator,
        conn: &mut ClientConnection,
    ) -> Result<()> {
        let routes = match pac.find_routes(conn.target()).await {
            Ok(routes) => routes,
            Err(e) => {
                let reason = e
                    .pac_reason_phrase()
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string());
                conn.write_error_response(e.status_code(), Some(&reason)).await;
                return Err(e);
            }
        };
        debug!("Candidate routes: {:?}", routes);

        if routes.is_empty() {
            conn.write_bad_gateway("Proxy Auto Config error: no available proxy server")
                .await;
            return Err(PorticoError::NoRouteAvailable);
        }

        let last = routes.len() - 1;
        for (index, route) in routes.iter().enumerate() {
            let processor = self.processors.select(conn.is_connect(), route.kind.is_http());
            match processor.process(conn, route).await {
                Ok(()) => break,
                Err(retry) => {
                    debug!("Failed to connect to route {}: {}", route, retry);
                    self.blacklist.blacklist(route);
                    if index == last {
                        conn.write_bad_gateway(&retry.message).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_manual(&self, conn: &mut ClientConnection) -> Result<()> {
        let route = self
            .manual_route
            .as_ref()
            .ok_or_else(|| PorticoError::Internal("manual mode without a route".to_string()))?;
        let processor = self.processors.select(conn.is_connect(), route.kind.is_http());
        if let Err(retry) = processor.process(conn, route).await {
            // One candidate, no fallback: report and be done. The manual
            // route is deliberately never blacklisted.
            debug!("Failed to connect to route {}: {}", route, retry);
            conn.write_bad_gateway(&retry.message).await;
        }
        Ok(())
    }
}
