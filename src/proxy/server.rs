//! The facade's listening socket and accept loop

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::handler::ClientHandler;

/// Accept connections until shutdown is signalled, spawning one task per
/// accepted socket. Request-level errors never reach this loop; it only
/// ever observes closed connections.
pub async fn run(
    listener: TcpListener,
    handler: Arc<ClientHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        debug!("Accepted connection from {}", client_addr);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_connection(stream).await {
                                debug!("Error on handling connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Local proxy server shutting down");
                    break;
                }
            }
        }
    }
}
