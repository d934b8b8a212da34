//! Outbound reply queue and the writer task that drains it.
//!
//! The queue is the only piece of session state touched from outside the
//! session task (other sessions and the backend push replies into it), so
//! it carries its own lock. A single writer task per connection owns the
//! write half, which keeps at most one write in flight.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::{wait_closed, SessionHandle};
use crate::error::CloseReason;

/// An immutable reply payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Message(Arc<str>);

impl Message {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

#[derive(Default)]
pub struct OutboundQueue {
    pending: Mutex<VecDeque<Message>>,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns `true` when the queue was empty, i.e. this
    /// push is what starts a drain; otherwise the running drain reaches it.
    pub fn push(&self, msg: Message) -> bool {
        let started = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.push_back(msg);
            was_empty
        };
        if started {
            self.ready.notify_one();
        }
        started
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Clone of the head. The message stays queued until [`pop`](Self::pop).
    fn head(&self) -> Option<Message> {
        self.pending.lock().front().cloned()
    }

    fn pop(&self) {
        self.pending.lock().pop_front();
    }

    /// Drop everything still queued; returns how many messages were lost.
    pub(super) fn abandon(&self) -> usize {
        let mut pending = self.pending.lock();
        let lost = pending.len();
        pending.clear();
        lost
    }

    /// Wake the writer without queueing anything, so it re-checks `closing`.
    pub(super) fn kick(&self) {
        self.ready.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.pending.lock().iter().map(|m| m.as_str().to_string()).collect()
    }
}

/// Drain the session's queue into `writer` until the session closes.
pub(super) async fn run_writer<W>(handle: SessionHandle, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = handle.closed_watch();
    let queue = handle.queue();

    'session: loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            _ = queue.ready.notified() => {}
        }

        while let Some(msg) = queue.head() {
            let written = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => break 'session,
                res = write_message(&mut writer, &msg) => res,
            };
            match written {
                Ok(()) => queue.pop(),
                Err(e) => {
                    handle.cleanup(CloseReason::WriteFailed(e));
                    break 'session;
                }
            }
        }

        if handle.is_closing() {
            handle.cleanup(CloseReason::Drained);
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(session_id = %handle.id(), "Shutdown error: {e}");
    }
}

async fn write_message<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(msg.as_str().as_bytes()).await?;
    writer.flush().await
}
