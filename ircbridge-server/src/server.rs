//! Server state and TCP listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::backend::{Backend, ClientPool};
use crate::config::ServerConfig;
use crate::connection::{self, Commands, SessionHandle, SessionSettings};
use crate::error::CloseReason;

/// How long a ctrl-c shutdown waits for sessions to finish tearing down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    pub settings: Arc<SessionSettings>,
    /// Verb tables, built once and read by every session.
    pub commands: Arc<Commands>,
    pub backend: Arc<dyn Backend>,
    /// session_id -> handle of every live session
    pub sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SharedState {
    pub fn new(config: ServerConfig, backend: Arc<dyn Backend>) -> Result<Arc<Self>> {
        let access = config
            .access_list()
            .context("Failed to load access list")?;
        tracing::info!(?access, "Access list loaded");
        Ok(Arc::new(Self {
            settings: Arc::new(SessionSettings::new(&config, access)),
            commands: Arc::new(Commands::new()),
            backend,
            sessions: Mutex::new(HashMap::new()),
            config,
        }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Force cleanup on every live session.
    pub fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        tracing::info!("Shutting down {} session(s)", handles.len());
        for handle in handles {
            handle.cleanup(CloseReason::Shutdown);
        }
    }
}

pub struct Server {
    config: ServerConfig,
    backend: Arc<dyn Backend>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            backend: Arc::new(ClientPool::new()),
        }
    }

    /// Create a server with a custom backend (for testing or embedding).
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn Backend>) -> Self {
        Self { config, backend }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        SharedState::new(self.config.clone(), Arc::clone(&self.backend))
    }

    /// Run the server until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("Listening on {}", self.config.listen_addr);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => on_accept(accepted, &state),
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        state.shutdown_all();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while state.session_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    /// Start the server and return the bound address, the shared state and
    /// the accept task (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                on_accept(listener.accept().await, &accept_state);
            }
        });

        Ok((addr, state, handle))
    }
}

/// Accept errors are logged and the listener keeps going.
fn on_accept(
    accepted: std::io::Result<(tokio::net::TcpStream, SocketAddr)>,
    state: &Arc<SharedState>,
) {
    match accepted {
        Ok((stream, _addr)) => spawn_connection(stream, Arc::clone(state)),
        Err(e) => tracing::error!("Accept error: {e}"),
    }
}

fn spawn_connection(stream: tokio::net::TcpStream, state: Arc<SharedState>) {
    tokio::spawn(async move {
        if let Err(e) = connection::handle(stream, state).await {
            tracing::error!("Connection error: {e}");
        }
    });
}
