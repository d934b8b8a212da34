//! The backend collaborator: the pool of bridged clients behind the gateway.
//!
//! Sessions delegate roster and messaging verbs here and notify the
//! backend on cleanup. [`ClientPool`] is the in-process implementation: an
//! in-memory roster that relays messages between sessions sharing a
//! channel.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::connection::SessionHandle;
use crate::error::BackendError;
use crate::protocol;

/// Operations a session delegates to the client pool.
///
/// Calls come from the session task and must not block. Replies that are
/// produced later (or for other sessions) go through
/// [`SessionHandle::deliver`], which is safe from any thread.
pub trait Backend: Send + Sync {
    /// `NAME`: bring up a bridged client under `name`.
    fn join(&self, session: &SessionHandle, name: &str) -> Result<(), BackendError>;
    /// `MESSAGE`: send `text` through the session's bridged client.
    fn message(&self, session: &SessionHandle, text: &str) -> Result<(), BackendError>;
    /// `CHANNELLIST`: report the session's channels back to it.
    fn list_channels(&self, session: &SessionHandle) -> Result<(), BackendError>;
    /// `ADDCHANNEL`
    fn add_channel(&self, session: &SessionHandle, channel: &str) -> Result<(), BackendError>;
    /// `REMOVECHANNEL`
    fn remove_channel(&self, session: &SessionHandle, channel: &str) -> Result<(), BackendError>;
    /// Release everything held for `session_id`. Called once per session.
    fn disconnect(&self, session_id: &str);
}

struct BridgedClient {
    name: String,
    channels: BTreeSet<String>,
    handle: SessionHandle,
}

/// In-memory client pool keyed by session ID.
#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<String, BridgedClient>>,
}

fn normalize_channel(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn client_name(&self, session_id: &str) -> Option<String> {
        self.clients.lock().get(session_id).map(|c| c.name.clone())
    }
}

impl Backend for ClientPool {
    fn join(&self, session: &SessionHandle, name: &str) -> Result<(), BackendError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BackendError::MissingArgument);
        }
        let mut clients = self.clients.lock();
        let taken = clients
            .iter()
            .any(|(sid, c)| sid != session.id() && c.name.eq_ignore_ascii_case(name));
        if taken {
            return Err(BackendError::NameInUse(name.to_string()));
        }
        match clients.get_mut(session.id()) {
            Some(client) => {
                tracing::info!(session_id = %session.id(), old = %client.name, new = %name, "Bridged client renamed");
                client.name = name.to_string();
            }
            None => {
                tracing::info!(session_id = %session.id(), %name, "Bridged client joined");
                clients.insert(
                    session.id().to_string(),
                    BridgedClient {
                        name: name.to_string(),
                        channels: BTreeSet::new(),
                        handle: session.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn message(&self, session: &SessionHandle, text: &str) -> Result<(), BackendError> {
        if text.is_empty() {
            return Err(BackendError::MissingArgument);
        }
        let (line, targets) = {
            let clients = self.clients.lock();
            let sender = clients.get(session.id()).ok_or(BackendError::NotJoined)?;
            let targets: Vec<SessionHandle> = clients
                .iter()
                .filter(|(sid, c)| {
                    sid.as_str() != session.id() && !c.channels.is_disjoint(&sender.channels)
                })
                .map(|(_, c)| c.handle.clone())
                .collect();
            (protocol::relayed_message(&sender.name, text), targets)
        };
        tracing::debug!(session_id = %session.id(), recipients = targets.len(), "Relaying message");
        for target in targets {
            target.deliver(line.as_str());
        }
        Ok(())
    }

    fn list_channels(&self, session: &SessionHandle) -> Result<(), BackendError> {
        let line = {
            let clients = self.clients.lock();
            let client = clients.get(session.id()).ok_or(BackendError::NotJoined)?;
            protocol::channel_list(client.channels.iter().map(String::as_str))
        };
        session.deliver(line);
        Ok(())
    }

    fn add_channel(&self, session: &SessionHandle, channel: &str) -> Result<(), BackendError> {
        let channel = normalize_channel(channel);
        if channel.is_empty() {
            return Err(BackendError::MissingArgument);
        }
        let mut clients = self.clients.lock();
        let client = clients.get_mut(session.id()).ok_or(BackendError::NotJoined)?;
        if client.channels.insert(channel.clone()) {
            tracing::info!(session_id = %session.id(), %channel, "Channel added");
        }
        Ok(())
    }

    fn remove_channel(&self, session: &SessionHandle, channel: &str) -> Result<(), BackendError> {
        let channel = normalize_channel(channel);
        if channel.is_empty() {
            return Err(BackendError::MissingArgument);
        }
        let mut clients = self.clients.lock();
        let client = clients.get_mut(session.id()).ok_or(BackendError::NotJoined)?;
        if !client.channels.remove(&channel) {
            return Err(BackendError::NotInChannel(channel));
        }
        tracing::info!(session_id = %session.id(), %channel, "Channel removed");
        Ok(())
    }

    fn disconnect(&self, session_id: &str) {
        if let Some(mut client) = self.clients.lock().remove(session_id) {
            client.channels.clear();
            tracing::info!(%session_id, name = %client.name, "Bridged client disconnected");
        }
    }
}
