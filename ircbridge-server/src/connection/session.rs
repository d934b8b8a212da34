//! Per-connection state machine.
//!
//! One [`Session`] is owned by one task. That task reads lines, dispatches
//! them, and consumes timer events, one event at a time, so `phase` and
//! `ping_outstanding` need no locking. The outbound queue and the
//! `closing`/`initialized` flags live in the shared [`SessionHandle`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

use super::dispatch::Commands;
use super::outbound;
use super::timer::{Timer, TimerFired, TimerKind};
use super::{wait_closed, SessionHandle};
use crate::backend::Backend;
use crate::config::{AccessList, ServerConfig};
use crate::error::CloseReason;
use crate::protocol::{self, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthorized,
    Authorized,
}

/// Per-session knobs derived from the server config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_name: String,
    pub registration_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_line_len: usize,
    pub access: AccessList,
}

impl SessionSettings {
    pub fn new(config: &ServerConfig, access: AccessList) -> Self {
        Self {
            server_name: config.server_name.clone(),
            registration_timeout: config.registration_timeout(),
            keepalive_interval: config.keepalive_interval(),
            max_line_len: config.max_line_len,
            access,
        }
    }
}

pub struct Session {
    handle: SessionHandle,
    settings: Arc<SessionSettings>,
    commands: Arc<Commands>,
    phase: Phase,
    ping_outstanding: bool,
    remote_identity: Option<String>,
    /// Set while skipping the rest of an over-long line.
    discarding_line: bool,
    registration_timer: Timer,
    keepalive_timer: Timer,
    timer_events: mpsc::UnboundedReceiver<TimerFired>,
}

impl Session {
    pub fn new(
        id: String,
        peer: Option<SocketAddr>,
        settings: Arc<SessionSettings>,
        commands: Arc<Commands>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let (events_tx, timer_events) = mpsc::unbounded_channel();
        Self {
            handle: SessionHandle::new(id, peer, backend),
            settings,
            commands,
            phase: Phase::Unauthorized,
            ping_outstanding: false,
            remote_identity: None,
            discarding_line: false,
            registration_timer: Timer::new(TimerKind::Registration, events_tx.clone()),
            keepalive_timer: Timer::new(TimerKind::Keepalive, events_tx),
            timer_events,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    #[cfg(test)]
    pub(crate) fn remote_identity(&self) -> Option<&str> {
        self.remote_identity.as_deref()
    }

    /// Drive the session until it is cleaned up.
    pub async fn run<R, W>(mut self, reader: R, writer: W)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.start();
        let writer_task = tokio::spawn(outbound::run_writer(self.handle.clone(), writer));
        self.read_loop(reader).await;
        self.registration_timer.cancel();
        self.keepalive_timer.cancel();
        if let Err(e) = writer_task.await {
            tracing::error!(session_id = %self.id(), "Writer task failed: {e}");
        }
    }

    fn start(&mut self) {
        self.handle.mark_initialized();
        self.registration_timer.arm(self.settings.registration_timeout);
    }

    async fn read_loop<R>(&mut self, mut reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut closed = self.handle.closed_watch();
        // Kept across iterations: a read interrupted by a timer event
        // leaves its partial line here.
        let mut buf = Vec::new();

        loop {
            let reading = !self.handle.is_closing();
            let limit = self.read_limit(&buf);
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => break,
                Some(fired) = self.timer_events.recv() => self.on_timer(fired),
                read = read_capped(&mut reader, &mut buf, limit), if reading => {
                    self.on_read(read, &mut buf);
                }
            }
        }
    }

    /// Bytes the next read may add to `buf`: one past `max_line_len`, so an
    /// unterminated over-long line is detected without buffering more.
    fn read_limit(&self, buf: &[u8]) -> u64 {
        (self.settings.max_line_len + 1).saturating_sub(buf.len()).max(1) as u64
    }

    /// Handle the outcome of one capped read into `buf`.
    pub(crate) fn on_read(&mut self, read: io::Result<usize>, buf: &mut Vec<u8>) {
        let n = match read {
            Ok(0) => {
                self.handle.cleanup(CloseReason::PeerClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                self.handle.cleanup(CloseReason::ReadFailed(e));
                return;
            }
        };
        let terminated = buf.last() == Some(&b'\n');

        if self.discarding_line {
            buf.clear();
            if terminated {
                self.discarding_line = false;
            }
            return;
        }
        if !terminated && buf.len() > self.settings.max_line_len {
            tracing::warn!(session_id = %self.id(), read = n, "Unterminated line too long, discarding");
            buf.clear();
            self.discarding_line = true;
            self.handle.deliver(protocol::LINE_TOO_LONG);
            return;
        }

        let raw = String::from_utf8_lossy(buf).into_owned();
        buf.clear();
        self.on_line(&raw);
    }

    /// Process one raw input line, terminator included.
    pub(crate) fn on_line(&mut self, raw: &str) {
        if raw.len() > self.settings.max_line_len {
            tracing::warn!(session_id = %self.id(), len = raw.len(), "Line too long, dropping");
            self.handle.deliver(protocol::LINE_TOO_LONG);
            return;
        }
        let line = protocol::trim_line_ending(raw);
        if line.is_empty() {
            return;
        }

        if self.remote_identity.is_none() && !self.identify() {
            return;
        }

        tracing::debug!(session_id = %self.id(), "<- {line}");
        let reply = self.dispatch(line);
        self.handle.deliver(reply);
    }

    /// Record the peer and check it against the access list. Runs once.
    fn identify(&mut self) -> bool {
        let peer = self.handle.peer();
        let identity = peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string());
        self.remote_identity = Some(identity.clone());

        if !self.settings.access.permits(peer.map(|addr| addr.ip())) {
            tracing::warn!(session_id = %self.id(), peer = %identity, "Peer not on access list");
            self.handle.cleanup(CloseReason::Unauthorized(identity));
            return false;
        }
        tracing::info!(session_id = %self.id(), peer = %identity, "Client identified");
        true
    }

    fn dispatch(&mut self, line: &str) -> String {
        let Command { verb, arg } = protocol::split_command(line);
        let commands = Arc::clone(&self.commands);
        match self.phase {
            Phase::Unauthorized => commands.registration.dispatch(verb, arg, self),
            Phase::Authorized => {
                commands
                    .authorized
                    .dispatch(verb, protocol::strip_colon(arg), self)
            }
        }
    }

    /// Registration is complete: swap the registration deadline for the
    /// keepalive window and greet the client.
    pub fn authorize(&mut self) {
        if self.phase == Phase::Authorized {
            return;
        }
        self.registration_timer.cancel();
        self.phase = Phase::Authorized;
        self.keepalive_timer.arm(self.settings.keepalive_interval);
        tracing::info!(session_id = %self.id(), "Session authorized");
        self.handle
            .deliver(protocol::welcome(&self.settings.server_name, self.id()));
    }

    /// Stop all deadlines and close once the outbound queue is flushed.
    pub fn begin_close(&mut self) {
        self.registration_timer.cancel();
        self.keepalive_timer.cancel();
        self.handle.request_close();
    }

    /// Queue a final diagnostic, then close after it is written.
    fn close_with(&mut self, diagnostic: &'static str) {
        // Queued before `closing` is raised so the writer cannot see an
        // empty queue in between.
        self.handle.deliver(diagnostic);
        self.begin_close();
    }

    pub fn on_pong(&mut self) {
        if !self.ping_outstanding {
            return;
        }
        self.ping_outstanding = false;
        self.keepalive_timer.arm(self.settings.keepalive_interval);
    }

    pub(crate) fn on_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::Registration => {
                if !self.registration_timer.accept(fired) {
                    tracing::trace!(session_id = %self.id(), "Stale registration timer");
                    return;
                }
                if self.phase == Phase::Unauthorized {
                    tracing::warn!(session_id = %self.id(), "Registration timeout");
                    self.close_with(protocol::REGISTRATION_TIMEOUT);
                }
            }
            TimerKind::Keepalive => {
                if !self.keepalive_timer.accept(fired) {
                    tracing::trace!(session_id = %self.id(), "Stale keepalive timer");
                    return;
                }
                if self.ping_outstanding {
                    tracing::warn!(session_id = %self.id(), "Ping timeout");
                    self.close_with(protocol::CONNECTION_TIMEOUT);
                } else {
                    self.ping_outstanding = true;
                    let now = chrono::Utc::now().timestamp();
                    self.handle.deliver(protocol::ping_probe(now));
                    self.keepalive_timer.arm(self.settings.keepalive_interval);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn next_timer_event(&mut self) -> TimerFired {
        self.timer_events
            .recv()
            .await
            .expect("session holds the timer senders")
    }

    #[cfg(test)]
    pub(crate) fn timers_active(&self) -> (bool, bool) {
        (
            self.registration_timer.is_active(),
            self.keepalive_timer.is_active(),
        )
    }
}

/// `read_until` through a `take` so at most `limit` bytes land in `buf`.
/// Cancel safe: bytes already read stay in `buf`.
async fn read_capped<R>(reader: &mut R, buf: &mut Vec<u8>, limit: u64) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader.take(limit).read_until(b'\n', buf).await
}
