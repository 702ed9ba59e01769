//! The connection-processing engine
//!
//! Accept loop, per-connection handling, route transports, the CONNECT
//! tunnel machinery, and the session lifecycle controller.

pub mod body;
pub mod client;
pub mod handler;
pub mod processor;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod wire;

pub use body::RepeatableBody;
pub use client::ClientConnection;
pub use handler::ClientHandler;
pub use processor::{ConnectionProcessor, ProcessorSet};
pub use session::{LifecycleListener, ProxySession};
pub use transport::RouteConnector;
pub use tunnel::{Tunnel, TunnelEstablisher, TunnelOutcome};
