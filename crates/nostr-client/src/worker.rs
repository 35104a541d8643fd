//! The relay-worker state machine: one task owns one WebSocket to one
//! relay, processes control commands from its connection handle, and
//! streams inbound frames back out, correlating replies to the request
//! that caused them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::{ClientMessage, Event, RelayMessage};
use rand::RngCore;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;
use crate::signer::Signer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Upgrading,
    Connected,
    Closing,
}

pub struct PublishConfirmation {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

pub struct CountResult {
    pub count: u64,
    pub hll: Option<String>,
}

/// Per-subscription delivery: the worker forwards relay frames tagged by
/// kind rather than handing subscribers the raw wire enum, in the
/// `{nostr, event|eose|closed, sub_id, ...}` shape a subscriber expects.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Event(Event),
    Eose,
    Closed(String),
    /// The worker stopped while this subscription was still open.
    Error(String),
}

/// Connection lifecycle notifications for a session's optional listener.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting { relay_url: String },
    Connected { relay_url: String },
    /// A NIP-42 AUTH round completed successfully, proactively or as part
    /// of a publish retry.
    Authenticated { relay_url: String },
    Error { relay_url: String, reason: String },
}

pub(crate) enum Command {
    Connect { reply: oneshot::Sender<Result<(), ClientError>> },
    Publish { event: Event, reply: oneshot::Sender<Result<PublishConfirmation, ClientError>> },
    Subscribe {
        sub_id: String,
        filters: Vec<Value>,
        subscriber: mpsc::UnboundedSender<SubscriptionEvent>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    CloseSubscription { sub_id: String },
    Count { sub_id: String, filters: Vec<Value>, reply: oneshot::Sender<Result<CountResult, ClientError>> },
    NegOpen { sub_id: String, filter: Value, initial_message: String, reply: oneshot::Sender<Result<(), ClientError>> },
    NegMsg { sub_id: String, message: String, reply: oneshot::Sender<Result<String, ClientError>> },
    NegClose { sub_id: String },
    /// Drives a NIP-42 AUTH round to completion, or resolves immediately if
    /// the session is already authenticated.
    Authenticate { reply: oneshot::Sender<Result<(), ClientError>> },
    Disconnect,
}

struct PendingPublish {
    reply: oneshot::Sender<Result<PublishConfirmation, ClientError>>,
    event: Event,
    retried: bool,
}

/// Tracks an in-flight NIP-42 AUTH round. `auth_event_id` is what the
/// relay's `OK` will echo back. `retry_event_id` names a publish to
/// re-send once the relay accepts the AUTH, for a round started to
/// unblock a `restricted: ... auth` retry; `None` for a round started
/// proactively off an unsolicited `["AUTH", challenge]`.
struct PendingAuth {
    auth_event_id: String,
    retry_event_id: Option<String>,
}

struct NegSession {
    outstanding: Option<oneshot::Sender<Result<String, ClientError>>>,
}

pub(crate) struct Worker {
    url: Url,
    phase: Phase,
    signer: Option<Arc<dyn Signer>>,
    challenge: Option<String>,
    authenticated: bool,
    pending_publishes: HashMap<String, PendingPublish>,
    pending_counts: HashMap<String, oneshot::Sender<Result<CountResult, ClientError>>>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<SubscriptionEvent>>,
    neg_sessions: HashMap<String, NegSession>,
    pending_auth: Option<PendingAuth>,
    auth_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    raw_tx: mpsc::UnboundedSender<RelayMessage>,
    notify: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Worker {
    pub(crate) fn new(
        url: Url,
        signer: Option<Arc<dyn Signer>>,
        raw_tx: mpsc::UnboundedSender<RelayMessage>,
        notify: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        Self {
            url,
            phase: Phase::Disconnected,
            signer,
            challenge: None,
            authenticated: false,
            pending_publishes: HashMap::new(),
            pending_counts: HashMap::new(),
            subscriptions: HashMap::new(),
            neg_sessions: HashMap::new(),
            pending_auth: None,
            auth_waiters: Vec::new(),
            raw_tx,
            notify,
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(notify) = &self.notify {
            let _ = notify.send(event);
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut sink = None;
        let mut stream = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Connect { reply }) => {
                            self.emit(SessionEvent::Connecting { relay_url: self.url.to_string() });
                            match self.do_connect().await {
                                Ok((s, r)) => {
                                    sink = Some(s);
                                    stream = Some(r);
                                    self.phase = Phase::Connected;
                                    self.emit(SessionEvent::Connected { relay_url: self.url.to_string() });
                                    let _ = reply.send(Ok(()));
                                }
                                Err(err) => {
                                    self.emit(SessionEvent::Error { relay_url: self.url.to_string(), reason: err.to_string() });
                                    let _ = reply.send(Err(err));
                                }
                            }
                        }
                        Some(Command::Publish { event, reply }) => {
                            self.handle_publish(event, reply, sink.as_mut()).await;
                        }
                        Some(Command::Subscribe { sub_id, filters, subscriber, reply }) => {
                            self.handle_subscribe(sub_id, filters, subscriber, reply, sink.as_mut()).await;
                        }
                        Some(Command::CloseSubscription { sub_id }) => {
                            self.subscriptions.remove(&sub_id);
                            self.send(sink.as_mut(), ClientMessage::Close { sub_id }).await;
                        }
                        Some(Command::Count { sub_id, filters, reply }) => {
                            self.handle_count(sub_id, filters, reply, sink.as_mut()).await;
                        }
                        Some(Command::NegOpen { sub_id, filter, initial_message, reply }) => {
                            if let Some(mut previous) = self.neg_sessions.remove(&sub_id) {
                                if let Some(waiter) = previous.outstanding.take() {
                                    let _ = waiter.send(Err(ClientError::NegClosed { replaced: true }));
                                }
                            }
                            self.neg_sessions.insert(sub_id.clone(), NegSession { outstanding: None });
                            self.send(sink.as_mut(), ClientMessage::NegOpen { sub_id, filter, initial_message }).await;
                            let _ = reply.send(Ok(()));
                        }
                        Some(Command::NegMsg { sub_id, message, reply }) => {
                            self.handle_neg_msg(sub_id, message, reply, sink.as_mut()).await;
                        }
                        Some(Command::NegClose { sub_id }) => {
                            self.neg_sessions.remove(&sub_id);
                            self.send(sink.as_mut(), ClientMessage::NegClose { sub_id }).await;
                        }
                        Some(Command::Authenticate { reply }) => {
                            self.handle_authenticate(reply, sink.as_mut()).await;
                        }
                        Some(Command::Disconnect) | None => {
                            self.phase = Phase::Closing;
                            break;
                        }
                    }
                }
                inbound = async {
                    match stream.as_mut() {
                        Some(s) => s.next().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_inbound(&text, sink.as_mut()).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            self.terminate(ClientError::RemoteClose { code: 1000, reason });
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(url = %self.url, error = %err, "relay stream error");
                            self.terminate(ClientError::StreamError(err.to_string()));
                            break;
                        }
                        None => {
                            self.terminate(ClientError::RemoteClose { code: 1000, reason: "stream ended".into() });
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn do_connect(&mut self) -> Result<(WsSink, WsStream), ClientError> {
        self.phase = Phase::Upgrading;
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|err| ClientError::ConnectError(err.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((sink, stream))
    }

    async fn handle_publish(
        &mut self,
        event: Event,
        reply: oneshot::Sender<Result<PublishConfirmation, ClientError>>,
        sink: Option<&mut WsSink>,
    ) {
        if self.phase != Phase::Connected {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }
        if self.pending_publishes.contains_key(&event.id) {
            let _ = reply.send(Err(ClientError::PublishAlreadyPending));
            return;
        }
        let event_id = event.id.clone();
        self.send(sink, ClientMessage::Event(event.clone())).await;
        self.pending_publishes.insert(event_id, PendingPublish { reply, event, retried: false });
    }

    async fn handle_subscribe(
        &mut self,
        sub_id: String,
        filters: Vec<Value>,
        subscriber: mpsc::UnboundedSender<SubscriptionEvent>,
        reply: oneshot::Sender<Result<(), ClientError>>,
        sink: Option<&mut WsSink>,
    ) {
        if self.phase != Phase::Connected {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }
        if let Some(existing) = self.subscriptions.get(&sub_id) {
            if !existing.same_channel(&subscriber) {
                debug!(sub_id, "subscription id already taken by a different subscriber");
                let _ = reply.send(Err(ClientError::SubIdTaken));
                return;
            }
            let _ = reply.send(Ok(()));
            return;
        }
        self.subscriptions.insert(sub_id.clone(), subscriber);
        self.send(sink, ClientMessage::Req { sub_id, filters }).await;
        let _ = reply.send(Ok(()));
    }

    async fn handle_count(
        &mut self,
        sub_id: String,
        filters: Vec<Value>,
        reply: oneshot::Sender<Result<CountResult, ClientError>>,
        sink: Option<&mut WsSink>,
    ) {
        if self.phase != Phase::Connected {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }
        let query_id = fresh_query_id();
        self.pending_counts.insert(query_id.clone(), reply);
        self.send(sink, ClientMessage::Count { sub_id: query_id, filters }).await;
        let _ = sub_id; // the client-chosen sub_id is superseded by query_id correlation
    }

    async fn handle_neg_msg(
        &mut self,
        sub_id: String,
        message: String,
        reply: oneshot::Sender<Result<String, ClientError>>,
        sink: Option<&mut WsSink>,
    ) {
        let Some(session) = self.neg_sessions.get_mut(&sub_id) else {
            let _ = reply.send(Err(ClientError::NegNotOpen));
            return;
        };
        if session.outstanding.is_some() {
            let _ = reply.send(Err(ClientError::NegMsgAlreadyPending));
            return;
        }
        session.outstanding = Some(reply);
        self.send(sink, ClientMessage::NegMsg { sub_id, message }).await;
    }

    async fn handle_inbound(&mut self, text: &str, sink: Option<&mut WsSink>) {
        let Ok(message) = RelayMessage::from_json(text) else {
            warn!(url = %self.url, "failed to decode relay message");
            return;
        };
        let _ = self.raw_tx.send(message.clone());

        match message {
            RelayMessage::Ok { event_id, accepted, message } => {
                if self.pending_auth.as_ref().is_some_and(|a| a.auth_event_id == event_id) {
                    self.complete_auth(accepted, message, sink).await;
                } else {
                    self.complete_publish(event_id, accepted, message, sink).await;
                }
            }
            RelayMessage::Count { sub_id, count, hll } => {
                if let Some(reply) = self.pending_counts.remove(&sub_id) {
                    let _ = reply.send(Ok(CountResult { count, hll }));
                }
            }
            RelayMessage::Closed { sub_id, message } => {
                if let Some(reply) = self.pending_counts.remove(&sub_id) {
                    let _ = reply.send(Err(ClientError::SessionStopped { reason: message.clone() }));
                }
                if let Some(subscriber) = self.subscriptions.remove(&sub_id) {
                    let _ = subscriber.send(SubscriptionEvent::Closed(message));
                }
            }
            RelayMessage::Event { sub_id, event } => {
                if let Some(subscriber) = self.subscriptions.get(&sub_id) {
                    let _ = subscriber.send(SubscriptionEvent::Event(event));
                }
            }
            RelayMessage::Eose { sub_id } => {
                if let Some(subscriber) = self.subscriptions.get(&sub_id) {
                    let _ = subscriber.send(SubscriptionEvent::Eose);
                }
            }
            RelayMessage::Auth { challenge } => {
                self.challenge = Some(challenge);
                if !self.authenticated && self.pending_auth.is_none() && self.signer.is_some() {
                    let _ = self.start_auth(None, sink).await;
                }
            }
            RelayMessage::NegMsg { sub_id, message } => {
                if let Some(session) = self.neg_sessions.get_mut(&sub_id) {
                    if let Some(reply) = session.outstanding.take() {
                        let _ = reply.send(Ok(message));
                    }
                }
            }
            RelayMessage::NegErr { sub_id, message } => {
                let class = message.split_whitespace().next().unwrap_or("").to_string();
                if let Some(mut session) = self.neg_sessions.remove(&sub_id) {
                    if let Some(reply) = session.outstanding.take() {
                        let _ = reply.send(Err(ClientError::NegErr { class, message }));
                    }
                }
            }
            RelayMessage::Notice { .. } => {}
        }
    }

    /// A `restricted: ... auth` rejection (case-insensitive on the `auth`
    /// token) triggers exactly one NIP-42 retry.
    async fn complete_publish(&mut self, event_id: String, accepted: bool, message: String, sink: Option<&mut WsSink>) {
        let Some(pending) = self.pending_publishes.get(&event_id) else { return };

        let is_auth_rejection = !accepted
            && message.starts_with("restricted")
            && message.to_lowercase().contains("auth");

        if is_auth_rejection && !pending.retried {
            if self.start_auth(Some(event_id.clone()), sink).await.is_ok() {
                return;
            }
        }

        if let Some(pending) = self.pending_publishes.remove(&event_id) {
            let _ = pending.reply.send(Ok(PublishConfirmation { event_id, accepted, message }));
        }
    }

    /// Drives `Command::Authenticate`: resolves immediately if already
    /// authenticated, joins an in-flight round as a waiter, or starts a
    /// fresh proactive round if the relay has already sent a challenge.
    async fn handle_authenticate(&mut self, reply: oneshot::Sender<Result<(), ClientError>>, sink: Option<&mut WsSink>) {
        if self.authenticated {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.pending_auth.is_some() {
            self.auth_waiters.push(reply);
            return;
        }
        if self.signer.is_none() {
            let _ = reply.send(Err(ClientError::InvalidSigner));
            return;
        }
        match self.start_auth(None, sink).await {
            Ok(()) => self.auth_waiters.push(reply),
            Err(()) => {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
        }
    }

    /// Signs and sends a kind-22242 AUTH event against the relay's last
    /// known challenge. `retry_event_id`, when present, names a publish to
    /// re-send once the relay accepts; `None` marks a proactive round.
    async fn start_auth(&mut self, retry_event_id: Option<String>, sink: Option<&mut WsSink>) -> Result<(), ()> {
        let Some(challenge) = self.challenge.clone() else { return Err(()) };
        let Some(signer) = self.signer.as_ref() else { return Err(()) };
        let relay_url = self.url.to_string();
        let Ok(auth_event) = signer.sign_auth_event(&relay_url, &challenge) else { return Err(()) };

        if let Some(event_id) = &retry_event_id {
            if let Some(pending) = self.pending_publishes.get_mut(event_id) {
                pending.retried = true;
            }
        }
        self.pending_auth = Some(PendingAuth { auth_event_id: auth_event.id.clone(), retry_event_id });
        let sink = match sink {
            Some(s) => s,
            None => return Err(()),
        };
        if let Ok(json) = ClientMessage::Auth(auth_event).to_json() {
            let _ = sink.send(WsMessage::Text(json.into())).await;
        }
        Ok(())
    }

    /// Resolves the pending NIP-42 round started by [`start_auth`]. On
    /// success marks the session authenticated, notifies any
    /// `Command::Authenticate` waiters and the session listener, and
    /// re-sends the original EVENT if this round was a publish retry; on
    /// rejection fails the waiters and that publish directly.
    async fn complete_auth(&mut self, accepted: bool, message: String, sink: Option<&mut WsSink>) {
        let Some(pending_auth) = self.pending_auth.take() else { return };
        let waiters = std::mem::take(&mut self.auth_waiters);

        if !accepted {
            for waiter in waiters {
                let _ = waiter.send(Err(ClientError::AuthFailed(message.clone())));
            }
            if let Some(retry_event_id) = pending_auth.retry_event_id {
                if let Some(pending) = self.pending_publishes.remove(&retry_event_id) {
                    let _ = pending.reply.send(Err(ClientError::AuthFailed(message)));
                }
            }
            return;
        }

        self.authenticated = true;
        self.emit(SessionEvent::Authenticated { relay_url: self.url.to_string() });
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }

        let Some(retry_event_id) = pending_auth.retry_event_id else { return };
        let Some(pending) = self.pending_publishes.get(&retry_event_id) else { return };
        self.send(sink, ClientMessage::Event(pending.event.clone())).await;
    }

    /// Fails every outstanding waiter with a single `session_stopped` reason
    /// and tears down the subscription registry.
    fn terminate(&mut self, reason: ClientError) {
        self.phase = Phase::Disconnected;
        self.emit(SessionEvent::Error { relay_url: self.url.to_string(), reason: reason.to_string() });
        for (_, pending) in self.pending_publishes.drain() {
            let _ = pending.reply.send(Err(ClientError::SessionStopped { reason: reason.to_string() }));
        }
        for (_, reply) in self.pending_counts.drain() {
            let _ = reply.send(Err(ClientError::SessionStopped { reason: reason.to_string() }));
        }
        for (_, subscriber) in self.subscriptions.drain() {
            let _ = subscriber.send(SubscriptionEvent::Error(reason.to_string()));
        }
        for (_, mut session) in self.neg_sessions.drain() {
            if let Some(waiter) = session.outstanding.take() {
                let _ = waiter.send(Err(ClientError::SessionStopped { reason: reason.to_string() }));
            }
        }
        self.pending_auth = None;
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::SessionStopped { reason: reason.to_string() }));
        }
    }

    async fn send(&self, sink: Option<&mut WsSink>, message: ClientMessage) {
        let Some(sink) = sink else { return };
        let Ok(json) = message.to_json() else { return };
        if let Err(err) = sink.send(WsMessage::Text(json.into())).await {
            warn!(url = %self.url, error = %err, "failed to write to relay socket");
        }
    }
}

fn fresh_query_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
pub(crate) type WsStream =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

pub(crate) const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);
