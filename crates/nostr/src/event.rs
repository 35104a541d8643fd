use bitcoin::key::Keypair;
use bitcoin::secp256k1::{rand, schnorr::Signature, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{NostrError, Result};

pub const KIND_METADATA: u64 = 0;
pub const KIND_SHORT_TEXT_NOTE: u64 = 1;
pub const KIND_CONTACTS: u64 = 3;
pub const KIND_DELETION: u64 = 5;
pub const KIND_CHANNEL_METADATA: u64 = 41;
pub const KIND_CLIENT_AUTH: u64 = 22242;
pub const KIND_GIFT_WRAP: u64 = 1059;

/// Inclusive kind ranges used by the store's replaceable-event collapse rules.
pub const REPLACEABLE_RANGE: std::ops::RangeInclusive<u64> = 10_000..=19_999;
pub const EPHEMERAL_RANGE: std::ops::RangeInclusive<u64> = 20_000..=29_999;
pub const PARAMETERIZED_REPLACEABLE_RANGE: std::ops::RangeInclusive<u64> = 30_000..=39_999;

pub fn is_replaceable(kind: u64) -> bool {
    kind == KIND_METADATA || kind == KIND_CONTACTS || REPLACEABLE_RANGE.contains(&kind)
}

pub fn is_ephemeral(kind: u64) -> bool {
    EPHEMERAL_RANGE.contains(&kind)
}

pub fn is_parameterized_replaceable(kind: u64) -> bool {
    PARAMETERIZED_REPLACEABLE_RANGE.contains(&kind)
}

/// A fully signed Nostr event, as it appears on the wire and in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// An event template supplied by a caller who does not yet know the signer's pubkey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// An event with its signer attached but not yet hashed or signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Event {
    /// Returns the value of the first `e` tag, used by NIP-09 deletion targets
    /// and kind-41 channel root resolution.
    pub fn first_tag_value(&self, tag_name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(tag_name) && t.len() > 1)
            .map(|t| t[1].as_str())
    }

    pub fn tag_values<'a>(&'a self, tag_name: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(tag_name) && t.len() > 1)
            .map(|t| t[1].as_str())
    }

    /// Expiration timestamp from NIP-40's `expiration` tag, if present and well-formed.
    pub fn expiration(&self) -> Option<i64> {
        self.first_tag_value("expiration")?.parse().ok()
    }
}

/// Generates a new secret key using the crate's secure RNG.
pub fn generate_secret_key() -> SecretKey {
    let secp = Secp256k1::new();
    let (secret_key, _) = secp.generate_keypair(&mut rand::thread_rng());
    secret_key
}

/// Returns the 32-byte x-only public key, hex encoded, for a secret key.
pub fn get_public_key_hex(secret_key: &SecretKey) -> Result<String> {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, secret_key);
    let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
    Ok(hex::encode(xonly.serialize()))
}

/// Canonical NIP-01 serialization: `[0, pubkey, created_at, kind, tags, content]`.
pub fn serialize_event(unsigned: &UnsignedEvent) -> Result<String> {
    let value = serde_json::json!([
        0,
        unsigned.pubkey,
        unsigned.created_at,
        unsigned.kind,
        unsigned.tags,
        unsigned.content,
    ]);
    Ok(serde_json::to_string(&value)?)
}

/// Computes the event id: the lowercase hex SHA-256 of the canonical serialization.
pub fn get_event_hash(unsigned: &UnsignedEvent) -> Result<String> {
    let serialized = serialize_event(unsigned)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Builds, hashes, and signs an event template with the given secret key.
pub fn finalize_event(template: &EventTemplate, secret_key: &SecretKey) -> Result<Event> {
    let pubkey = get_public_key_hex(secret_key)?;
    let unsigned = UnsignedEvent {
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, secret_key);
    let id_bytes = hex::decode(&id).map_err(|_| NostrError::MalformedHex)?;
    let message = Message::from_digest_slice(&id_bytes).map_err(|_| NostrError::MalformedHex)?;
    let signature = secp.sign_schnorr_with_rng(&message, &keypair, &mut rand::thread_rng());

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(signature.as_ref() as &[u8]),
    })
}

fn is_lower_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Structural validation only: id and sig must be exactly 64/128 lowercase hex
/// characters and pubkey exactly 64. Does not check the signature itself.
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Full verification: recomputes the id from the event's fields and checks the
/// Schnorr signature against the claimed pubkey.
pub fn verify_event(event: &Event) -> Result<bool> {
    if !validate_event(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let expected_id = get_event_hash(&unsigned)?;
    if expected_id != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::new();
    let id_bytes = hex::decode(&event.id).map_err(|_| NostrError::MalformedHex)?;
    let message = match Message::from_digest_slice(&id_bytes) {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    let pubkey_bytes = hex::decode(&event.pubkey).map_err(|_| NostrError::MalformedHex)?;
    let xonly = match XOnlyPublicKey::from_slice(&pubkey_bytes) {
        Ok(p) => p,
        Err(_) => return Ok(false),
    };
    let sig_bytes = hex::decode(&event.sig).map_err(|_| NostrError::MalformedHex)?;
    let signature = match Signature::from_slice(&sig_bytes) {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };

    Ok(secp.verify_schnorr(&signature, &message, &xonly).is_ok())
}
