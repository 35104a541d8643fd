//! NIP-11 relay information document assembly. The HTTP route that serves
//! this under `Accept: application/nostr+json` is out of scope here; this
//! module only builds the JSON body from [`RelayInfoConfig`] and
//! [`Limitation`], since the NIP-42 AUTH relay-URL check reads the same
//! config.

use serde_json::{json, Value};

use crate::config::{Limitation, RelayInfoConfig};

/// Assembles the NIP-11 document body for `relay_info`/`limitation`.
pub fn document(relay_info: &RelayInfoConfig, limitation: &Limitation) -> Value {
    json!({
        "name": relay_info.name,
        "description": relay_info.description,
        "software": relay_info.software,
        "version": relay_info.version,
        "supported_nips": relay_info.supported_nips,
        "fees": relay_info.fees,
        "limitation": {
            "max_message_length": limitation.max_message_length,
            "max_subscriptions": limitation.max_subscriptions,
            "max_limit": limitation.max_limit,
            "max_subid_length": limitation.max_subid_length,
            "max_event_tags": limitation.max_event_tags,
            "max_content_length": limitation.max_content_length,
            "min_pow_difficulty": limitation.min_pow_difficulty,
            "restricted_writes": limitation.restricted_writes,
            "created_at_lower_limit": limitation.created_at_lower_limit,
            "created_at_upper_limit": limitation.created_at_upper_limit,
        },
    })
}
