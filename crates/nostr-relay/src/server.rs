//! Binds the configured listener and serves WebSocket upgrades until asked
//! to stop. Split from `main.rs` so integration tests can start a relay
//! in-process on an ephemeral port.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::bus::EventBus;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::session::{ws_upgrade_handler, RelayState};
use crate::store::Database;

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, store: Database) -> Self {
        let state = Arc::new(RelayState { config, store: Arc::new(store), bus: Arc::new(EventBus::new()) });
        Self { state }
    }

    /// Binds `config.bind_addr` and serves connections until the process is
    /// asked to stop. Resolves once the listener is closed.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        info!(addr = %self.state.config.bind_addr, "relay listening");
        let app = Router::new().route("/", get(ws_upgrade_handler)).with_state(self.state.clone());
        axum::serve(listener, app).await?;
        Ok(())
    }
}
