//! A Nostr relay: WebSocket session handling, the inbound-message pipeline,
//! durable event storage, and subscription fan-out.

mod bus;
mod config;
mod error;
mod pipeline;
mod relay_info;
mod server;
mod session;
mod store;
mod subscription;

pub use bus::EventBus;
pub use config::{AuthConfig, AuthMode, Limitation, RelayConfig, RelayInfoConfig, RelayPolicyConfig};
pub use error::{RelayError, Result};
pub use relay_info::document as relay_info_document;
pub use server::RelayServer;
pub use store::{Database, DatabaseConfig, InsertOutcome, QueryOptions};
pub use subscription::Filter;
