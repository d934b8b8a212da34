//! Verb dispatch.
//!
//! Two immutable tables are built once per server and shared by every
//! session: one for the registration phase (only `CONNECT`) and one for
//! authorized sessions. Handlers are stateless; everything they change
//! lives in the [`Session`] passed to them.

use std::collections::HashMap;

use super::session::Session;
use crate::protocol;

/// A command handler. Returns the reply to queue, or an empty string.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, verb: &str, arg: &str, session: &mut Session) -> String;
}

pub struct CommandTable {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandTable {
    fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    fn with(mut self, verb: &'static str, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(verb, Box::new(handler));
        self
    }

    /// Verbs accepted before `CONNECT`.
    pub fn registration() -> Self {
        Self::empty().with("CONNECT", Connect)
    }

    /// Verbs accepted once the session is authorized.
    pub fn authorized() -> Self {
        Self::empty()
            .with("NAME", Delegate(BackendOp::Join))
            .with("MESSAGE", Delegate(BackendOp::Message))
            .with("CHANNELLIST", Delegate(BackendOp::ListChannels))
            .with("ADDCHANNEL", Delegate(BackendOp::AddChannel))
            .with("REMOVECHANNEL", Delegate(BackendOp::RemoveChannel))
            .with("QUIT", Quit)
            .with("PING", Ping)
            .with("PONG", Pong)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }

    /// Run the handler for `verb`, falling back to the unknown-command reply.
    pub fn dispatch(&self, verb: &str, arg: &str, session: &mut Session) -> String {
        match self.handlers.get(verb) {
            Some(handler) => handler.handle(verb, arg, session),
            None => Unknown.handle(verb, arg, session),
        }
    }
}

/// Both phase tables.
pub struct Commands {
    pub registration: CommandTable,
    pub authorized: CommandTable,
}

impl Commands {
    pub fn new() -> Self {
        Self {
            registration: CommandTable::registration(),
            authorized: CommandTable::authorized(),
        }
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self::new()
    }
}

struct Connect;

impl CommandHandler for Connect {
    fn handle(&self, _verb: &str, _arg: &str, session: &mut Session) -> String {
        session.authorize();
        String::new()
    }
}

struct Quit;

impl CommandHandler for Quit {
    fn handle(&self, _verb: &str, _arg: &str, session: &mut Session) -> String {
        tracing::info!(session_id = %session.id(), "Client quit");
        session.begin_close();
        String::new()
    }
}

struct Ping;

impl CommandHandler for Ping {
    fn handle(&self, _verb: &str, arg: &str, _session: &mut Session) -> String {
        protocol::pong(arg)
    }
}

struct Pong;

impl CommandHandler for Pong {
    fn handle(&self, _verb: &str, _arg: &str, session: &mut Session) -> String {
        session.on_pong();
        String::new()
    }
}

struct Unknown;

impl CommandHandler for Unknown {
    fn handle(&self, verb: &str, _arg: &str, session: &mut Session) -> String {
        tracing::debug!(session_id = %session.id(), verb, "Unknown command");
        protocol::unknown_command(verb)
    }
}

/// Backend operation a delegating verb maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Join,
    Message,
    ListChannels,
    AddChannel,
    RemoveChannel,
}

struct Delegate(BackendOp);

impl CommandHandler for Delegate {
    fn handle(&self, verb: &str, arg: &str, session: &mut Session) -> String {
        let handle = session.handle().clone();
        let backend = handle.backend();
        let result = match self.0 {
            BackendOp::Join => backend.join(&handle, arg),
            BackendOp::Message => backend.message(&handle, arg),
            BackendOp::ListChannels => backend.list_channels(&handle),
            BackendOp::AddChannel => backend.add_channel(&handle, arg),
            BackendOp::RemoveChannel => backend.remove_channel(&handle, arg),
        };
        match result {
            Ok(()) => String::new(),
            Err(e) => {
                tracing::debug!(session_id = %handle.id(), verb, "Backend rejected command: {e}");
                protocol::backend_failed(verb, &e)
            }
        }
    }
}
