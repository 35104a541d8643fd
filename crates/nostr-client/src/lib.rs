//! The multi-relay client: a per-relay worker that owns one WebSocket, a
//! thin connection handle tests and callers drive directly, a keyed
//! session registry that deduplicates workers by (relay URL, pubkey), and
//! a logical multi-relay session that fans writes and counts out across a
//! read/write relay set.

mod connection;
mod error;
mod multi_relay;
mod session_manager;
mod signer;
mod worker;

pub use connection::RelayConnection;
pub use error::ClientError;
pub use multi_relay::{MultiRelayEvent, MultiRelaySession, RelayMode};
pub use session_manager::{SessionKey, SessionManager, SessionOptions};
pub use signer::{KeypairSigner, Signer};
pub use worker::{CountResult, PublishConfirmation, SessionEvent, SubscriptionEvent};
