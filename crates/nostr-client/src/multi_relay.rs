//! The logical multi-relay session: a mutable relay membership, each
//! entry `(normalized_url, mode, worker_ref)`, with parallel fan-out for
//! publish/count and monitor-driven removal when a member's worker
//! exits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::Event;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::connection::RelayConnection;
use crate::error::ClientError;
use crate::signer::Signer;
use crate::worker::{CountResult, PublishConfirmation, SessionEvent};

/// Read-only members are included in `count` fan-out but not `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Read,
    ReadWrite,
}

/// Notifications a [`MultiRelaySession`] emits about its own membership,
/// independent of any one member's [`SessionEvent`] stream.
#[derive(Debug, Clone)]
pub enum MultiRelayEvent {
    RelayError { url: String, reason: String },
    RelayRemoved { url: String },
}

struct Member {
    mode: RelayMode,
    connection: Arc<RelayConnection>,
}

/// A mutable set of relay connections presented as one logical session:
/// `publish` and `count` fan out to the matching membership in parallel,
/// and a member whose worker exits is pruned automatically.
pub struct MultiRelaySession {
    members: Mutex<BTreeMap<String, Member>>,
    notify: mpsc::UnboundedSender<MultiRelayEvent>,
}

impl MultiRelaySession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MultiRelayEvent>) {
        let (notify, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { members: Mutex::new(BTreeMap::new()), notify }), rx)
    }

    /// Connects to `relay_url` with `mode` and spawns a monitor that
    /// removes the entry (and emits `RelayError` then `RelayRemoved`)
    /// once the member's worker reports it has stopped.
    pub async fn add_relay(self: &Arc<Self>, relay_url: Url, mode: RelayMode, signer: Option<Arc<dyn Signer>>) -> Result<(), ClientError> {
        let key = relay_url.to_string();
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(RelayConnection::with_notify(relay_url, signer, Some(session_tx)));
        connection.connect().await?;

        {
            let mut members = self.members.lock().await;
            members.insert(key.clone(), Member { mode, connection });
        }

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                if let SessionEvent::Error { reason, .. } = event {
                    this.remove_relay_with_reason(&key, reason).await;
                    break;
                }
            }
        });

        Ok(())
    }

    async fn remove_relay_with_reason(&self, url: &str, reason: String) {
        let removed = self.members.lock().await.remove(url).is_some();
        if removed {
            let _ = self.notify.send(MultiRelayEvent::RelayError { url: url.to_string(), reason });
            let _ = self.notify.send(MultiRelayEvent::RelayRemoved { url: url.to_string() });
        }
    }

    pub async fn remove_relay(&self, relay_url: &str) {
        let member = self.members.lock().await.remove(relay_url);
        if let Some(member) = member {
            member.connection.disconnect();
        }
    }

    pub async fn update_relay_mode(&self, relay_url: &str, mode: RelayMode) -> Result<(), ClientError> {
        let mut members = self.members.lock().await;
        match members.get_mut(relay_url) {
            Some(member) => {
                member.mode = mode;
                Ok(())
            }
            None => Err(ClientError::InvalidRelayUrl(relay_url.to_string())),
        }
    }

    /// Current membership, sorted by url (the `BTreeMap` key order).
    pub async fn list_relays(&self) -> Vec<(String, RelayMode)> {
        self.members.lock().await.iter().map(|(url, member)| (url.clone(), member.mode)).collect()
    }

    /// Fans `event` out to every `read_write` member in parallel, each
    /// bounded by `timeout`. Returns a result per member url.
    pub async fn publish(&self, event: Event, timeout: Duration) -> Result<BTreeMap<String, Result<PublishConfirmation, ClientError>>, ClientError> {
        let targets: Vec<(String, Arc<RelayConnection>)> = self
            .members
            .lock()
            .await
            .iter()
            .filter(|(_, member)| member.mode == RelayMode::ReadWrite)
            .map(|(url, member)| (url.clone(), member.connection.clone()))
            .collect();

        if targets.is_empty() {
            return Err(ClientError::NoWritableRelays);
        }

        let futures = targets.into_iter().map(|(url, connection)| {
            let event = event.clone();
            async move { (url, connection.publish_event(event, timeout).await) }
        });
        let results = futures::future::join_all(futures).await;
        Ok(results.into_iter().collect())
    }

    /// Fans `filters` out to every `read` and `read_write` member in
    /// parallel, each bounded by `timeout`. Returns a result per member
    /// url.
    pub async fn count(&self, sub_id: String, filters: Vec<Value>, timeout: Duration) -> Result<BTreeMap<String, Result<CountResult, ClientError>>, ClientError> {
        let targets: Vec<(String, Arc<RelayConnection>)> =
            self.members.lock().await.iter().map(|(url, member)| (url.clone(), member.connection.clone())).collect();

        if targets.is_empty() {
            return Err(ClientError::NoReadableRelays);
        }

        let futures = targets.into_iter().map(|(url, connection)| {
            let sub_id = sub_id.clone();
            let filters = filters.clone();
            async move { (url, connection.count(sub_id, filters, timeout).await) }
        });
        let results = futures::future::join_all(futures).await;
        Ok(results.into_iter().collect())
    }
}
