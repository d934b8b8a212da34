//! Error types shared across the session, backend and config layers.

use std::io;

/// Failure of a delegated backend operation.
///
/// These never close a connection; the handler renders them into an
/// `ERROR:` reply and the session carries on.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("missing argument")]
    MissingArgument,
    #[error("name {0} is already in use")]
    NameInUse(String),
    #[error("no bridged client, send NAME first")]
    NotJoined,
    #[error("not in channel {0}")]
    NotInChannel(String),
    #[error("{0}")]
    Rejected(String),
}

/// Why a session was torn down.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read failed: {0}")]
    ReadFailed(io::Error),
    #[error("write failed: {0}")]
    WriteFailed(io::Error),
    /// `closing` was set and the outbound queue ran dry.
    #[error("closed after flushing pending replies")]
    Drained,
    #[error("peer {0} is not on the access list")]
    Unauthorized(String),
    #[error("server shutdown")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid access list entry {0:?}")]
    InvalidEntry(String),
}
