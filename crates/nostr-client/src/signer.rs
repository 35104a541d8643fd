//! The signer capability a relay session asks to produce NIP-42 auth
//! events. A real application supplies its own (e.g. backed by a hardware
//! signer or NIP-07 bridge); `KeypairSigner` covers the common case of a
//! locally held secret key.

use bitcoin::secp256k1::SecretKey;
use nostr::{auth_event_template, finalize_event, get_public_key_hex, Event};

use crate::error::ClientError;

pub trait Signer: Send + Sync {
    fn pubkey_hex(&self) -> Result<String, ClientError>;
    fn sign_auth_event(&self, relay_url: &str, challenge: &str) -> Result<Event, ClientError>;
}

pub struct KeypairSigner {
    secret_key: SecretKey,
}

impl KeypairSigner {
    pub fn new(secret_key: SecretKey) -> Self {
        Self { secret_key }
    }
}

impl Signer for KeypairSigner {
    fn pubkey_hex(&self) -> Result<String, ClientError> {
        get_public_key_hex(&self.secret_key).map_err(|_| ClientError::InvalidSigner)
    }

    fn sign_auth_event(&self, relay_url: &str, challenge: &str) -> Result<Event, ClientError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;
        let template = auth_event_template(relay_url, challenge, now);
        finalize_event(&template, &self.secret_key).map_err(|err| ClientError::AuthFailed(err.to_string()))
    }
}
