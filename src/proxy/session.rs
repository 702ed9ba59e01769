//! Proxy session lifecycle
//!
//! The session is the control surface: `start()` runs the ordered
//! lifecycle hooks, binds the listener and spawns the accept loop;
//! `stop()` shuts the loop down and runs the stop hooks that reset
//! session-scoped state (PAC engine pool, blacklist, credential cache).
//! Both are serialized by one mutex and `stop()` is idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::handler::ClientHandler;
use super::server;
use crate::blacklist::RouteBlacklist;
use crate::config::{Config, ProxyMode};
use crate::credentials::{CredentialsProvider, CredentialsStore, StaticCredentials};
use crate::error::{PorticoError, Result};
use crate::pac::PacEvaluator;

/// A stateful component that participates in session start/stop.
///
/// Participants are registered as an explicit ordered list at session
/// construction; start hooks run in order, stop hooks run in the same
/// order on stop and after a failed start.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this participant is active for the given mode.
    fn applies_to(&self, _mode: ProxyMode) -> bool {
        true
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    fn on_stop(&self);
}

#[async_trait]
impl LifecycleListener for PacEvaluator {
    fn name(&self) -> &'static str {
        "pac-evaluator"
    }

    fn applies_to(&self, mode: ProxyMode) -> bool {
        mode.is_pac()
    }

    async fn on_start(&self) -> Result<()> {
        self.start().await
    }

    fn on_stop(&self) {
        self.shutdown();
    }
}

#[async_trait]
impl LifecycleListener for RouteBlacklist {
    fn name(&self) -> &'static str {
        "route-blacklist"
    }

    fn on_stop(&self) {
        let cleared = self.clear();
        debug!("Cleared {} blacklisted routes", cleared);
    }
}

#[async_trait]
impl LifecycleListener for CredentialsStore {
    fn name(&self) -> &'static str {
        "credentials-store"
    }

    fn on_stop(&self) {
        self.reset();
    }
}

enum SessionState {
    Stopped,
    Running {
        local_addr: SocketAddr,
        shutdown_tx: watch::Sender<bool>,
        accept_task: JoinHandle<()>,
    },
}

/// The facade's start/stop controller.
pub struct ProxySession {
    config: Arc<Config>,
    blacklist: Arc<RouteBlacklist>,
    pac: Option<Arc<PacEvaluator>>,
    credentials: Arc<CredentialsStore>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    state: Mutex<SessionState>,
    running: AtomicBool,
}

impl ProxySession {
    /// Build a session with credentials taken from the configuration.
    pub fn new(config: Config) -> Self {
        let provider = Arc::new(StaticCredentials::new(
            config.proxy.username.clone(),
            config.proxy.password.clone(),
        ));
        Self::with_credentials(config, provider)
    }

    /// Build a session with an external credentials provider.
    pub fn with_credentials(config: Config, provider: Arc<dyn CredentialsProvider>) -> Self {
        let config = Arc::new(config);
        let blacklist = Arc::new(RouteBlacklist::new(config.proxy.blacklist_timeout()));
        let credentials = Arc::new(CredentialsStore::new(provider));
        let pac = config.proxy.mode.is_pac().then(|| {
            Arc::new(PacEvaluator::new(
                config.pac.location.clone(),
                config.pac.pool_size,
                blacklist.clone(),
            ))
        });

        let mut listeners: Vec<Arc<dyn LifecycleListener>> = Vec::new();
        if let Some(pac) = &pac {
            listeners.push(pac.clone());
        }
        listeners.push(blacklist.clone());
        listeners.push(credentials.clone());

        Self {
            config,
            blacklist,
            pac,
            credentials,
            listeners,
            state: Mutex::new(SessionState::Stopped),
            running: AtomicBool::new(false),
        }
    }

    /// Register an additional lifecycle participant. Only meaningful
    /// before the first start.
    pub fn add_listener(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// Begin the proxy session. Returns the bound local address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Running { .. }) {
            return Err(PorticoError::AlreadyStarted);
        }

        let mode = self.config.proxy.mode;
        info!("Starting local proxy facade in {} mode", mode.as_str());

        for listener in &self.listeners {
            if !listener.applies_to(mode) {
                debug!("Start hook skipped for {}", listener.name());
                continue;
            }
            debug!("Running start hook for {}", listener.name());
            if let Err(e) = listener.on_start().await {
                self.run_stop_hooks(mode);
                return Err(e);
            }
        }

        let handler = match ClientHandler::new(
            self.config.clone(),
            self.blacklist.clone(),
            self.pac.clone(),
            self.credentials.clone(),
        ) {
            Ok(handler) => Arc::new(handler),
            Err(e) => {
                self.run_stop_hooks(mode);
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(self.config.proxy.local_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.run_stop_hooks(mode);
                return Err(PorticoError::Io(e));
            }
        };
        let local_addr = listener.local_addr()?;
        info!("Local proxy server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(server::run(listener, handler, shutdown_rx));

        *state = SessionState::Running {
            local_addr,
            shutdown_tx,
            accept_task,
        };
        self.running.store(true, Ordering::SeqCst);
        Ok(local_addr)
    }

    /// End the proxy session. A no-op when not running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SessionState::Stopped) {
            SessionState::Stopped => {
                info!("Already stopped, nothing to do");
            }
            SessionState::Running {
                shutdown_tx,
                accept_task,
                ..
            } => {
                self.running.store(false, Ordering::SeqCst);
                let _ = shutdown_tx.send(true);
                if let Err(e) = accept_task.await {
                    debug!("Accept loop ended abnormally: {}", e);
                }
                self.run_stop_hooks(self.config.proxy.mode);
                info!("Local proxy facade stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            SessionState::Running { local_addr, .. } => Some(*local_addr),
            SessionState::Stopped => None,
        }
    }

    /// The blacklist, for control-surface snapshots.
    pub fn blacklist(&self) -> &RouteBlacklist {
        &self.blacklist
    }

    fn run_stop_hooks(&self, mode: ProxyMode) {
        for listener in &self.listeners {
            if listener.applies_to(mode) {
                debug!("Running stop hook for {}", listener.name());
                listener.on_stop();
            }
        }
    }
}
