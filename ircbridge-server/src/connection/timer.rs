//! Session deadlines.
//!
//! A [`Timer`] never touches session state itself. When its deadline passes
//! it posts a [`TimerFired`] event into the session task, tagged with the
//! generation it was armed under. Every arm and cancel bumps the
//! generation, so a fire that raced with a rearm or cancel is recognised as
//! stale by [`Timer::accept`] and ignored.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Single-shot deadline for `CONNECT`.
    Registration,
    /// Ping/pong liveness window.
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub struct Timer {
    kind: TimerKind,
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TimerFired>,
}

impl Timer {
    pub fn new(kind: TimerKind, events: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            kind,
            generation: 0,
            armed: false,
            task: None,
            events,
        }
    }

    /// Arm for `after` from now, superseding any pending deadline.
    pub fn arm(&mut self, after: Duration) {
        self.abort_task();
        self.generation += 1;
        self.armed = true;

        let fired = TimerFired {
            kind: self.kind,
            generation: self.generation,
        };
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The session may already be gone.
            let _ = events.send(fired);
        }));
    }

    /// Cancel the pending deadline. No-op if already fired or canceled.
    pub fn cancel(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.generation += 1;
        self.abort_task();
    }

    pub fn is_active(&self) -> bool {
        self.armed
    }

    /// Claim a fire event. Returns `false` for events that belong to an
    /// earlier arming or to a canceled deadline.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        if fired.kind != self.kind || !self.armed || fired.generation != self.generation {
            return false;
        }
        self.armed = false;
        self.task = None;
        true
    }

    #[cfg(test)]
    pub(crate) fn generation_for_test(&self) -> u64 {
        self.generation
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort_task();
    }
}
