//! ircbridge: a line-oriented gateway that bridges IRC-style clients into a
//! backend client pool.
//!
//! Every accepted connection runs a [`connection::Session`]: it must send
//! `CONNECT` before the registration deadline, after which its verbs are
//! delegated to the [`backend::Backend`] and its liveness is checked with a
//! ping/pong keepalive.

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
