//! The keyed registry of per-relay sessions. A connection's shared
//! ownership lives only here, as `Arc<RelayConnection>`; nothing
//! downstream retains a strong cycle back to the registry itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::connection::RelayConnection;
use crate::error::ClientError;
use crate::signer::Signer;
use crate::worker::SessionEvent;

/// Normalized `(relay_url, pubkey)` registry key: lowercased scheme/host,
/// default ports (80 for ws, 443 for wss) stripped, path defaulted to
/// `/`, pubkey lowercased and validated as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    relay_url: String,
    pubkey: String,
}

impl SessionKey {
    pub fn new(relay_url: &str, pubkey: &str) -> Result<Self, ClientError> {
        let normalized_url = normalize_relay_url(relay_url)?;
        let normalized_pubkey = pubkey.to_lowercase();
        if !is_valid_pubkey(&normalized_pubkey) {
            return Err(ClientError::InvalidPubkey(pubkey.to_string()));
        }
        Ok(Self { relay_url: normalized_url, pubkey: normalized_pubkey })
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }
}

fn normalize_relay_url(raw: &str) -> Result<String, ClientError> {
    let url = Url::parse(raw).map_err(|err| ClientError::InvalidRelayUrl(err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ClientError::InvalidRelayUrl(format!("unsupported scheme: {other}"))),
    }
    // `Url` already lowercases scheme/host and strips the default port for
    // these "special" WHATWG schemes, and defaults an empty path to "/".
    Ok(url.to_string())
}

fn is_valid_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64 && pubkey.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Options accepted by [`SessionManager::get_or_start_session`].
#[derive(Default)]
pub struct SessionOptions {
    pub pubkey: Option<String>,
    pub signer: Option<Arc<dyn Signer>>,
    pub notify: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// A shared registry of live relay sessions, keyed by `(relay_url,
/// pubkey)`. `get_or_start_session` is atomic: concurrent callers racing
/// on the same key never spawn more than one worker.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionKey, Arc<RelayConnection>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_start_session(&self, relay_url: &str, opts: SessionOptions) -> Result<Arc<RelayConnection>, ClientError> {
        let pubkey = opts.pubkey.ok_or_else(|| ClientError::InvalidPubkey("pubkey is required".to_string()))?;
        let key = SessionKey::new(relay_url, &pubkey)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            return Ok(existing.clone());
        }

        let url = Url::parse(&key.relay_url).map_err(|err| ClientError::InvalidRelayUrl(err.to_string()))?;
        let connection = Arc::new(RelayConnection::with_notify(url, opts.signer, opts.notify));
        connection.connect().await?;
        sessions.insert(key, connection.clone());
        Ok(connection)
    }

    /// Drops the registry's reference to a session, e.g. after its worker
    /// has stopped. The session itself may still be held elsewhere via the
    /// `Arc` returned from `get_or_start_session`.
    pub async fn remove(&self, relay_url: &str, pubkey: &str) {
        if let Ok(key) = SessionKey::new(relay_url, pubkey) {
            self.sessions.lock().await.remove(&key);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899ab";

    #[test]
    fn normalizes_scheme_host_and_default_port() {
        let key = SessionKey::new("WSS://Relay.Example.com:443/", "a".repeat(64).as_str()).unwrap();
        assert_eq!(key.relay_url(), "wss://relay.example.com/");
    }

    #[test]
    fn lowercases_pubkey() {
        let key = SessionKey::new("wss://relay.example.com", &"AB".repeat(32)).unwrap();
        assert_eq!(key.pubkey(), "ab".repeat(32));
    }

    #[test]
    fn rejects_malformed_pubkey() {
        assert!(SessionKey::new("wss://relay.example.com", "not-hex").is_err());
    }

    #[test]
    fn rejects_wrong_length_pubkey_even_if_truncated_from_valid() {
        assert!(SessionKey::new("wss://relay.example.com", PUBKEY).is_err());
    }

    #[test]
    fn rejects_non_ws_scheme() {
        assert!(SessionKey::new("https://relay.example.com", &"a".repeat(64)).is_err());
    }

    #[test]
    fn default_path_is_slash() {
        let key = SessionKey::new("wss://relay.example.com", &"a".repeat(64)).unwrap();
        assert_eq!(key.relay_url(), "wss://relay.example.com/");
    }
}
