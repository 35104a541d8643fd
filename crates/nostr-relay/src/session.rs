//! Per-connection state and the WebSocket session contract: one upgrade
//! handshake, serialized inbound frame processing, and live fan-out
//! delivery to this connection's active subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use nostr::{Event, RelayMessage};
use rand::RngCore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::RelayConfig;
use crate::pipeline::{self, PipelineDeps};
use crate::store::Database;
use crate::subscription::Filter;

/// Per-WebSocket protocol state, owned exclusively by that connection's
/// task. Never shared or locked.
pub struct ConnectionState {
    pub connection_id: String,
    pub messages: u64,
    pub subscriptions: HashMap<String, Vec<Filter>>,
    pub challenge: String,
    pub authenticated_pubkeys: HashSet<String>,
    pub auth_required: bool,
}

impl ConnectionState {
    pub fn new(auth_required: bool) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            messages: 0,
            subscriptions: HashMap::new(),
            challenge: fresh_challenge(),
            authenticated_pubkeys: HashSet::new(),
            auth_required,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.authenticated_pubkeys.is_empty()
    }
}

/// A cryptographically random hex string of at least 16 bytes, issued once
/// per connection at upgrade time for the NIP-42 handshake.
fn fresh_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct RelayState {
    pub config: RelayConfig,
    pub store: Arc<Database>,
    pub bus: Arc<EventBus>,
}

pub async fn ws_upgrade_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut writer, mut reader) = socket.split();
    let mut conn = ConnectionState::new(state.config.auth.required);

    let auth_frame = RelayMessage::Auth { challenge: conn.challenge.clone() };
    if let Ok(json) = auth_frame.to_json() {
        if writer.send(WsMessage::Text(json.into())).await.is_err() {
            return;
        }
    }

    let mut bus_rx = state.bus.subscribe();

    loop {
        tokio::select! {
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let deps = PipelineDeps { config: &state.config, store: &state.store, bus: &state.bus };
                        let frames = pipeline::process(&text, &mut conn, &deps);
                        for frame in frames {
                            if let Ok(json) = frame.to_json() {
                                if writer.send(WsMessage::Text(json.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        // on_binary(_, state) -> {ok, state}; no response.
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(connection_id = %conn.connection_id, "connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(connection_id = %conn.connection_id, error = %err, "websocket stream error");
                        break;
                    }
                }
            }
            bus_event = bus_rx.recv() => {
                match bus_event {
                    Ok(event) => {
                        for frame in on_bus(&event, &conn) {
                            if let Ok(json) = frame.to_json() {
                                if writer.send(WsMessage::Text(json.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    on_close(&conn);
}

/// For each matching subscription, emits `["EVENT", sub_id, event]` subject
/// to the gift-wrap/DM visibility rules.
fn on_bus(event: &Event, conn: &ConnectionState) -> Vec<RelayMessage> {
    const KIND_ENCRYPTED_DM: u64 = 4;
    let restricted_kind = event.kind == KIND_ENCRYPTED_DM || event.kind == nostr::KIND_GIFT_WRAP;
    if restricted_kind {
        let visible = event.tag_values("p").any(|p| conn.authenticated_pubkeys.contains(p));
        if !visible {
            return Vec::new();
        }
    }

    conn.subscriptions
        .iter()
        .filter(|(_, filters)| filters.iter().any(|f| f.matches(event)))
        .map(|(sub_id, _)| RelayMessage::Event { sub_id: sub_id.clone(), event: event.clone() })
        .collect()
}

/// Removes the connection's subscriptions from the fan-out index. Since
/// subscriptions live entirely inside `ConnectionState` (dropped with the
/// task), there is nothing further to release here beyond logging.
fn on_close(conn: &ConnectionState) {
    debug!(connection_id = %conn.connection_id, subscriptions = conn.subscriptions.len(), "connection state dropped");
}
