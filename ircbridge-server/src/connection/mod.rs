//! Per-client connection handler.
//!
//! Each accepted stream gets a [`Session`] that manages:
//! - registration (`CONNECT` within the registration deadline)
//! - verb dispatch for the registration and authorized phases
//! - the keepalive ping/pong window
//! - a serialized outbound queue
//! - cleanup and backend notification
//!
//! The handler is split into submodules:
//! - [`session`]: the state machine and its read loop
//! - [`dispatch`]: verb tables and command handlers
//! - [`outbound`]: reply queue and the writer task
//! - [`timer`]: generation-tagged deadlines

pub mod dispatch;
pub mod outbound;
pub mod session;
pub mod timer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::backend::Backend;
use crate::error::CloseReason;
use crate::server::SharedState;

pub use dispatch::{BackendOp, CommandHandler, CommandTable, Commands};
pub use outbound::{Message, OutboundQueue};
pub use session::{Phase, Session, SessionSettings};

struct Shared {
    id: String,
    peer: Option<SocketAddr>,
    queue: OutboundQueue,
    closing: AtomicBool,
    initialized: AtomicBool,
    /// Flipped to `true` by cleanup; both I/O tasks stop on it.
    closed: watch::Sender<bool>,
    backend: Arc<dyn Backend>,
}

/// Cloneable, thread-safe reference to a session.
///
/// This is what the backend and other sessions hold. It can queue replies
/// and force cleanup; it cannot touch the phase or keepalive state, which
/// belong to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Shared>,
}

impl SessionHandle {
    fn new(id: String, peer: Option<SocketAddr>, backend: Arc<dyn Backend>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Shared {
                id,
                peer,
                queue: OutboundQueue::new(),
                closing: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                closed,
                backend,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    /// Queue a reply. Empty messages and messages for a cleaned-up session
    /// are dropped; returns whether the message was queued.
    pub fn deliver(&self, msg: impl Into<Message>) -> bool {
        let msg = msg.into();
        if msg.is_empty() || !self.is_open() {
            return false;
        }
        self.inner.queue.push(msg);
        true
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// False once cleanup has run.
    pub fn is_open(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Close once everything queued so far has been written.
    pub fn request_close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.queue.kick();
    }

    /// Tear the session down. Only the first call after start has any effect.
    pub fn cleanup(&self, reason: CloseReason) {
        if !self.inner.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let abandoned = self.inner.queue.abandon();
        match reason {
            CloseReason::Drained | CloseReason::PeerClosed | CloseReason::Shutdown => {
                tracing::info!(session_id = %self.id(), abandoned, "Session closed: {reason}");
            }
            _ => {
                tracing::warn!(session_id = %self.id(), abandoned, "Session closed: {reason}");
            }
        }
        self.inner.closed.send_replace(true);
        self.inner.backend.disconnect(self.id());
    }

    fn mark_initialized(&self) {
        self.inner.initialized.store(true, Ordering::Release);
    }

    fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closing", &self.is_closing())
            .field("open", &self.is_open())
            .finish()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens after teardown.
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();
    handle_io(BufReader::new(reader), writer, Some(peer), state).await
}

/// Handle a generic async stream (TLS wrappers, in-memory pipes in tests).
pub async fn handle_generic<S>(
    stream: S,
    peer: Option<SocketAddr>,
    state: Arc<SharedState>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, peer, state).await
}

async fn handle_io<R, W>(
    reader: BufReader<R>,
    writer: W,
    peer: Option<SocketAddr>,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let session_id = format!("conn-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    tracing::info!(%session_id, peer = ?peer, "New connection");

    let session = Session::new(
        session_id.clone(),
        peer,
        Arc::clone(&state.settings),
        Arc::clone(&state.commands),
        Arc::clone(&state.backend),
    );
    state
        .sessions
        .lock()
        .insert(session_id.clone(), session.handle().clone());

    session.run(reader, writer).await;

    state.sessions.lock().remove(&session_id);
    tracing::info!(%session_id, "Connection closed");
    Ok(())
}
