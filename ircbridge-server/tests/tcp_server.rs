//! Smoke tests over real loopback TCP through `Server::start`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ircbridge_server::backend::ClientPool;
use ircbridge_server::config::ServerConfig;
use ircbridge_server::server::Server;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        server_name: "smoke".to_string(),
        ..ServerConfig::default()
    }
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut line = String::new();
    timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("timed out")
        .expect("read");
    line
}

#[tokio::test]
async fn two_clients_relay_over_tcp() {
    let pool = Arc::new(ClientPool::new());
    let (addr, state, accept) = Server::with_backend(test_config(), pool.clone())
        .start()
        .await
        .unwrap();

    let (r, mut alice) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut alice_rx = BufReader::new(r);
    let (r, mut bob) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut bob_rx = BufReader::new(r);

    alice
        .write_all(b"CONNECT\r\nNAME alice\r\nADDCHANNEL #lobby\r\nPING a\r\n")
        .await
        .unwrap();
    assert!(read_line(&mut alice_rx).await.starts_with("WELCOME smoke conn-"));
    assert_eq!(read_line(&mut alice_rx).await, "PONG :a\n");

    bob.write_all(b"CONNECT\nNAME bob\nADDCHANNEL #LOBBY\nPING b\n")
        .await
        .unwrap();
    assert!(read_line(&mut bob_rx).await.starts_with("WELCOME smoke conn-"));
    assert_eq!(read_line(&mut bob_rx).await, "PONG :b\n");
    assert_eq!(state.session_count(), 2);
    assert_eq!(pool.len(), 2);

    alice.write_all(b"MESSAGE :over the wire\n").await.unwrap();
    assert_eq!(read_line(&mut bob_rx).await, "MESSAGE alice :over the wire\n");

    bob.write_all(b"QUIT\n").await.unwrap();
    assert_eq!(read_line(&mut bob_rx).await, "", "server closes after QUIT");

    state.shutdown_all();
    assert_eq!(read_line(&mut alice_rx).await, "");
    accept.abort();
}

#[tokio::test]
async fn silent_client_hits_registration_timeout() {
    let config = ServerConfig {
        registration_timeout_secs: 1,
        ..test_config()
    };
    let (addr, _state, accept) = Server::new(config).start().await.unwrap();

    let (r, _w) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut rx = BufReader::new(r);
    assert_eq!(read_line(&mut rx).await, "ERROR: registration timeout\n");
    assert_eq!(read_line(&mut rx).await, "");
    accept.abort();
}

#[tokio::test]
async fn accept_task_outlives_dropped_clients() {
    let (addr, state, accept) = Server::new(test_config()).start().await.unwrap();

    // Clients that vanish mid-handshake must not take the listener down.
    for _ in 0..5 {
        drop(TcpStream::connect(addr).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!accept.is_finished());

    let (r, mut w) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut rx = BufReader::new(r);
    w.write_all(b"CONNECT\n").await.unwrap();
    assert!(read_line(&mut rx).await.starts_with("WELCOME smoke conn-"));

    state.shutdown_all();
    accept.abort();
}
