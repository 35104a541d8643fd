//! A handle to one relay worker: the public surface tests and the session
//! manager drive directly. Owns the worker's command channel and the raw
//! inbound-frame stream; all actual protocol state lives in the spawned
//! [`crate::worker::Worker`] task.

use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, RelayMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use url::Url;

use crate::error::ClientError;
use crate::signer::Signer;
use crate::worker::{Command, CountResult, PublishConfirmation, SessionEvent, SubscriptionEvent, Worker, DEFAULT_BACKOFF};

/// One relay connection, owned by a single background task. Cheap to
/// clone via `Arc` — the [`SessionManager`](crate::SessionManager) and
/// [`MultiRelaySession`](crate::MultiRelaySession) hold shared handles
/// rather than the worker itself.
pub struct RelayConnection {
    url: Url,
    cmd_tx: mpsc::UnboundedSender<Command>,
    raw_rx: Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
}

impl RelayConnection {
    pub fn new(url: Url, signer: Option<Arc<dyn Signer>>) -> Self {
        Self::with_notify(url, signer, None)
    }

    pub fn with_notify(url: Url, signer: Option<Arc<dyn Signer>>, notify: Option<mpsc::UnboundedSender<SessionEvent>>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(url.clone(), signer, raw_tx, notify);
        tokio::spawn(worker.run(cmd_rx));
        Self { url, cmd_tx, raw_rx: Mutex::new(raw_rx) }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn dispatch_failure() -> ClientError {
        ClientError::SessionStopped { reason: "worker task is gone".to_string() }
    }

    /// Opens the TCP connection and completes the WebSocket upgrade.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Connect { reply: reply_tx }).map_err(|_| Self::dispatch_failure())?;
        reply_rx.await.map_err(|_| Self::dispatch_failure())?
    }

    /// Requests a graceful close. The worker task exits once it observes
    /// the command; this is not treated as a transient failure by a
    /// caller-side supervisor.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub async fn publish_event(&self, event: Event, timeout: Duration) -> Result<PublishConfirmation, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Publish { event, reply: reply_tx }).map_err(|_| Self::dispatch_failure())?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Self::dispatch_failure()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Registers a REQ subscription, retrying on `not_connected` with the
    /// worker's standard backoff until the worker reaches `connected` or
    /// the worker task itself goes away.
    pub async fn subscribe(
        &self,
        sub_id: String,
        filters: Vec<Value>,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionEvent>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(Command::Subscribe { sub_id: sub_id.clone(), filters: filters.clone(), subscriber: tx.clone(), reply: reply_tx })
                .map_err(|_| ClientError::SessionDown { reason: "worker task is gone".to_string() })?;
            match reply_rx.await {
                Ok(Ok(())) => return Ok(rx),
                Ok(Err(ClientError::NotConnected)) => {
                    tokio::time::sleep(DEFAULT_BACKOFF).await;
                    continue;
                }
                Ok(Err(other)) => return Err(other),
                Err(_) => return Err(ClientError::SessionDown { reason: "worker task is gone".to_string() }),
            }
        }
    }

    pub fn close_subscription(&self, sub_id: String) {
        let _ = self.cmd_tx.send(Command::CloseSubscription { sub_id });
    }

    pub async fn count(&self, sub_id: String, filters: Vec<Value>, timeout: Duration) -> Result<CountResult, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Count { sub_id, filters, reply: reply_tx }).map_err(|_| Self::dispatch_failure())?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Self::dispatch_failure()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn neg_open(&self, sub_id: String, filter: Value, initial_message: String) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::NegOpen { sub_id, filter, initial_message, reply: reply_tx })
            .map_err(|_| Self::dispatch_failure())?;
        reply_rx.await.map_err(|_| Self::dispatch_failure())?
    }

    pub async fn neg_msg(&self, sub_id: String, message: String, timeout: Duration) -> Result<String, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::NegMsg { sub_id, message, reply: reply_tx }).map_err(|_| Self::dispatch_failure())?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Self::dispatch_failure()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub fn neg_close(&self, sub_id: String) {
        let _ = self.cmd_tx.send(Command::NegClose { sub_id });
    }

    /// Drives a NIP-42 AUTH round to completion: signs and sends an AUTH
    /// event against the relay's last challenge and waits for its `OK`.
    /// Resolves immediately if the worker is already authenticated, or
    /// joins an in-flight round (started either by this call or reactively
    /// by the worker on receipt of `["AUTH", challenge]`) if one is
    /// already underway.
    pub async fn authenticate(&self, timeout: Duration) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Authenticate { reply: reply_tx }).map_err(|_| Self::dispatch_failure())?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Self::dispatch_failure()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Drains the next decoded relay frame, in the order the worker
    /// received it. Primarily useful in tests and simple single-relay
    /// callers; the session manager and multi-relay fanout prefer the
    /// per-subscription channels from [`Self::subscribe`].
    pub async fn recv(&self) -> Option<RelayMessage> {
        let mut guard = self.raw_rx.lock().await;
        guard.recv().await
    }
}
