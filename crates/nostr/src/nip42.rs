use crate::event::{verify_event, Event, EventTemplate, KIND_CLIENT_AUTH};
use crate::error::Result;

/// Builds an unsigned kind-22242 authentication event template for the given
/// relay URL and challenge, per NIP-42. Callers sign it with `finalize_event`.
pub fn auth_event_template(relay_url: &str, challenge: &str, created_at: i64) -> EventTemplate {
    EventTemplate {
        created_at,
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

/// Validates a received AUTH event against the challenge this side issued,
/// per NIP-42: correct kind, matching relay/challenge tags, fresh timestamp,
/// and a valid signature.
pub fn validate_auth_event(
    event: &Event,
    expected_challenge: &str,
    expected_relay_url: &str,
    now: i64,
    max_clock_skew_secs: i64,
) -> Result<bool> {
    if event.kind != KIND_CLIENT_AUTH {
        return Ok(false);
    }
    if event.first_tag_value("challenge") != Some(expected_challenge) {
        return Ok(false);
    }
    match event.first_tag_value("relay") {
        Some(relay) if relay_matches(relay, expected_relay_url) => {}
        _ => return Ok(false),
    }
    if (event.created_at - now).abs() > max_clock_skew_secs {
        return Ok(false);
    }
    verify_event(event)
}

fn relay_matches(tag_value: &str, expected: &str) -> bool {
    tag_value.trim_end_matches('/') == expected.trim_end_matches('/')
}
