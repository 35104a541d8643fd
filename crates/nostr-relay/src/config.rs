use std::net::SocketAddr;

use serde::Deserialize;

use crate::error::Result;

/// `relay_info.limitation`, read at startup and consulted by the policy
/// stage of the pipeline on every message.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limitation {
    pub max_message_length: usize,
    pub max_subscriptions: usize,
    pub max_limit: usize,
    pub max_subid_length: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    pub min_pow_difficulty: u32,
    pub restricted_writes: bool,
    /// Seconds before now; 0 disables the lower bound.
    pub created_at_lower_limit: i64,
    /// Seconds after now; 0 disables the upper bound.
    pub created_at_upper_limit: i64,
    pub default_limit: usize,
}

impl Default for Limitation {
    fn default() -> Self {
        Self {
            max_message_length: 8_000_000,
            max_subscriptions: 100,
            max_limit: 5_000,
            max_subid_length: 100,
            max_event_tags: 100,
            max_content_length: 8_192,
            min_pow_difficulty: 0,
            restricted_writes: false,
            created_at_lower_limit: 0,
            created_at_upper_limit: 0,
            default_limit: 500,
        }
    }
}

/// NIP-11 relay metadata, owned here only because the NIP-42 AUTH
/// relay-URL check needs `url` — the HTTP document body itself is
/// assembled by the `relay_info` module.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayInfoConfig {
    pub url: Option<String>,
    pub name: String,
    pub description: String,
    pub software: String,
    pub version: String,
    pub supported_nips: Vec<u32>,
    pub fees: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    Whitelist,
    Denylist,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub required: bool,
    pub mode: AuthMode,
    pub whitelist: Vec<String>,
    pub denylist: Vec<String>,
    /// Max clock skew tolerated between an AUTH event's `created_at` and the
    /// relay's own clock; also the window within which a challenge stays
    /// acceptable.
    pub timeout_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { required: false, mode: AuthMode::default(), whitelist: Vec::new(), denylist: Vec::new(), timeout_seconds: 600 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayPolicyConfig {
    /// 0 disables the minimum prefix length check.
    pub min_prefix_length: usize,
}

impl Default for RelayPolicyConfig {
    fn default() -> Self {
        Self { min_prefix_length: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub limitation: Limitation,
    pub relay_info: RelayInfoConfig,
    pub auth: AuthConfig,
    pub relay_policy: RelayPolicyConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("static address parses"),
            limitation: Limitation::default(),
            relay_info: RelayInfoConfig::default(),
            auth: AuthConfig::default(),
            relay_policy: RelayPolicyConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loads `NOSTR_RELAY_CONFIG` (default `./relay.toml`) merged with
    /// `NOSTR__`-prefixed environment overrides, e.g.
    /// `NOSTR__LIMITATION__MAX_SUBSCRIPTIONS=50`.
    pub fn load() -> Result<Self> {
        let path = std::env::var("NOSTR_RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("NOSTR").separator("__"));
        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    /// The relay URL this server expects AUTH events to reference, derived
    /// from `relay_info.url` or, if absent, from the bind address.
    pub fn expected_relay_url(&self) -> String {
        match &self.relay_info.url {
            Some(url) => url.clone(),
            None => format!("ws://{}", self.bind_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limitation_defaults_are_sane() {
        let limitation = Limitation::default();
        assert_eq!(limitation.max_message_length, 8_000_000);
        assert_eq!(limitation.max_subscriptions, 100);
        assert_eq!(limitation.max_subid_length, 100);
        assert_eq!(limitation.max_content_length, 8_192);
        assert_eq!(limitation.min_pow_difficulty, 0);
    }
}
