//! Shared harness for spawning a relay on an ephemeral port and waiting
//! for it to accept connections before a test proceeds.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use nostr_relay::{Database, DatabaseConfig, RelayConfig, RelayServer};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::connect_async;

static NEXT_PORT: AtomicU16 = AtomicU16::new(18_100);

pub fn next_test_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

pub fn test_relay_url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

pub fn test_relay_config(port: u16) -> RelayConfig {
    RelayConfig { bind_addr: format!("127.0.0.1:{port}").parse().unwrap(), ..Default::default() }
}

/// Starts a relay server on its own background task and blocks until it
/// accepts a WebSocket upgrade on `bind_addr`, or panics after 2 seconds.
pub async fn start_test_relay(config: RelayConfig) -> (Arc<RelayServer>, SocketAddr, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(DatabaseConfig { path: db_path, ..Default::default() }).unwrap();
    let bind_addr = config.bind_addr;
    let server = Arc::new(RelayServer::new(config, db));

    let server_clone = server.clone();
    let (err_tx, mut err_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(err) = server_clone.start().await {
            let _ = err_tx.send(err.to_string());
        }
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    let ws_url = test_relay_url(bind_addr.port());
    loop {
        if Instant::now() > deadline {
            panic!("test relay failed to start on {bind_addr}");
        }

        tokio::select! {
            result = &mut err_rx => {
                if let Ok(reason) = result {
                    panic!("test relay failed to start on {bind_addr}: {reason}");
                }
            }
            _ = sleep(Duration::from_millis(25)) => {}
        }

        if let Ok(Ok((mut ws_stream, _))) = timeout(Duration::from_millis(200), connect_async(&ws_url)).await {
            use futures_util::SinkExt;
            let _ = ws_stream.close(None).await;
            break;
        }
    }

    (server, bind_addr, temp_dir)
}
