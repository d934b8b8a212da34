//! Shared helpers for session tests: an in-memory client, a recording
//! backend, and writers that observe what the session does to its transport.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ircbridge_server::backend::Backend;
use ircbridge_server::config::ServerConfig;
use ircbridge_server::connection::{self, SessionHandle};
use ircbridge_server::error::BackendError;
use ircbridge_server::server::SharedState;

/// Upper bound for any single wait, in (possibly paused) tokio time.
pub const WAIT: Duration = Duration::from_secs(600);

pub fn loopback_peer() -> SocketAddr {
    "127.0.0.1:50123".parse().unwrap()
}

pub fn state_with(config: ServerConfig, backend: Arc<dyn Backend>) -> Arc<SharedState> {
    SharedState::new(config, backend).expect("config should load")
}

/// Client end of an in-memory connection.
pub struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    pub task: JoinHandle<anyhow::Result<()>>,
}

impl Client {
    pub fn connect(state: &Arc<SharedState>) -> Self {
        Self::connect_from(state, Some(loopback_peer()))
    }

    pub fn connect_from(state: &Arc<SharedState>, peer: Option<SocketAddr>) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(connection::handle_generic(server, peer, Arc::clone(state)));
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader: BufReader::new(reader),
            writer,
            task,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("send to session");
    }

    /// Next reply line, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a reply")
            .expect("read from session");
        (n > 0).then_some(line)
    }

    pub async fn expect(&mut self, expected: &str) {
        let got = self.recv().await;
        assert_eq!(got.as_deref(), Some(expected));
    }

    /// Round-trip a PING so every earlier line is known to be processed.
    pub async fn sync(&mut self) {
        self.send("PING sync\n").await;
        self.expect("PONG :sync\n").await;
    }

    pub async fn hang_up(&mut self) {
        self.writer.shutdown().await.expect("shutdown client");
    }

    pub async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None, "expected the server to close");
    }
}

/// Backend that records every call.
#[derive(Default)]
pub struct RecordingBackend {
    pub calls: Mutex<Vec<(&'static str, String)>>,
    pub disconnects: Mutex<Vec<String>>,
    /// When set, every delegated call fails with this reason.
    pub reject_with: Mutex<Option<String>>,
}

impl RecordingBackend {
    fn record(&self, op: &'static str, arg: &str) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push((op, arg.to_string()));
        match self.reject_with.lock().unwrap().clone() {
            Some(reason) => Err(BackendError::Rejected(reason)),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }
}

impl Backend for RecordingBackend {
    fn join(&self, _session: &SessionHandle, name: &str) -> Result<(), BackendError> {
        self.record("join", name)
    }
    fn message(&self, _session: &SessionHandle, text: &str) -> Result<(), BackendError> {
        self.record("message", text)
    }
    fn list_channels(&self, _session: &SessionHandle) -> Result<(), BackendError> {
        self.record("list_channels", "")
    }
    fn add_channel(&self, _session: &SessionHandle, channel: &str) -> Result<(), BackendError> {
        self.record("add_channel", channel)
    }
    fn remove_channel(&self, _session: &SessionHandle, channel: &str) -> Result<(), BackendError> {
        self.record("remove_channel", channel)
    }
    fn disconnect(&self, session_id: &str) {
        self.disconnects.lock().unwrap().push(session_id.to_string());
    }
}

/// Writer that logs each flushed message and counts shutdowns. Every
/// `poll_write` first yields once, so writes really are asynchronous.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    pub flushed: Arc<Mutex<Vec<String>>>,
    pub shutdowns: Arc<AtomicUsize>,
    current: Arc<Mutex<Vec<u8>>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    yielded: bool,
}

impl RecordingWriter {
    pub fn flushed(&self) -> Vec<String> {
        self.flushed.lock().unwrap().clone()
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if !self.yielded {
            self.yielded = true;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.yielded = false;
        self.current.lock().unwrap().extend_from_slice(buf);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let bytes = std::mem::take(&mut *self.current.lock().unwrap());
        if !bytes.is_empty() {
            self.flushed
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Writer whose writes always fail.
#[derive(Clone, Default)]
pub struct FailingWriter {
    pub shutdowns: Arc<AtomicUsize>,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Reader whose reads always fail.
pub struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
    }
}
