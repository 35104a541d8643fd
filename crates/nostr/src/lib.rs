//! Core Nostr protocol types: events, crypto, the wire codec, and the NIP-42
//! authentication handshake helpers shared by relay and client.

mod error;
mod event;
pub mod hll;
mod message;
mod nip42;

pub use error::{NostrError, Result};
pub use event::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key_hex, is_ephemeral,
    is_parameterized_replaceable, is_replaceable, serialize_event, validate_event, verify_event,
    Event, EventTemplate, UnsignedEvent, EPHEMERAL_RANGE, KIND_CHANNEL_METADATA, KIND_CLIENT_AUTH,
    KIND_CONTACTS, KIND_DELETION, KIND_GIFT_WRAP, KIND_METADATA, KIND_SHORT_TEXT_NOTE,
    PARAMETERIZED_REPLACEABLE_RANGE, REPLACEABLE_RANGE,
};
pub use message::{ClientMessage, RelayMessage};
pub use nip42::{auth_event_template, validate_auth_event};
