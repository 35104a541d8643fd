//! The staged inbound-frame validator: size -> protocol parse -> auth ->
//! message shape -> event semantics -> policy -> effects -> store policy.
//! Stages short-circuit on the first rejection; the engine always returns
//! whatever frames the failing stage (or its own default) queued.

use nostr::{Event, RelayMessage, UnsignedEvent};
use serde_json::Value;
use tracing::debug;

use crate::bus::EventBus;
use crate::config::RelayConfig;
use crate::session::ConnectionState;
use crate::store::{Database, InsertOutcome, QueryOptions};
use crate::subscription::Filter;

pub struct PipelineDeps<'a> {
    pub config: &'a RelayConfig,
    pub store: &'a Database,
    pub bus: &'a EventBus,
}

/// A structurally parsed EVENT candidate. `created_at` and `kind` are
/// `None` when the wire value was missing or not a plain integer (e.g. the
/// float/scientific-notation case), which the event-semantics stage turns
/// into a protocol-compliant `OK` rejection instead of a parse failure.
#[derive(Debug, Clone)]
struct EventCandidate {
    claimed_id: String,
    pubkey: String,
    created_at: Option<i64>,
    kind: Option<u64>,
    tags: Vec<Vec<String>>,
    content: String,
    sig: String,
}

enum Parsed {
    Event(EventCandidate),
    Req { sub_id: String, filters: Vec<Value> },
    Close { sub_id: String },
    Count { sub_id: String, filters: Vec<Value> },
    Auth(Event),
    NegOpen { sub_id: String, filter: Value, initial_message: String },
    NegMsg { sub_id: String, message: String },
    NegClose { sub_id: String },
    /// A shape this path recognizes but a relay never acts on (NOTICE,
    /// EOSE, OK, CLOSED, COUNT/AUTH/NEG-* echoes): MessageValidator turns
    /// these into `unsupported_message_type`.
    Unsupported,
}

pub fn process(raw_frame: &str, conn: &mut ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    conn.messages += 1;

    // 1. MessageSizeValidator
    if raw_frame.len() > deps.config.limitation.max_message_length {
        debug!(connection_id = %conn.connection_id, "message_too_large");
        return vec![RelayMessage::Notice { message: "message too large".to_string() }];
    }

    // 2. ProtocolValidator
    let parsed = match parse_frame(raw_frame) {
        Ok(p) => p,
        Err(()) => return vec![RelayMessage::Notice { message: "invalid message format".to_string() }],
    };

    // 3. AuthEnforcer
    if let Some(rejection) = auth_enforcer(&parsed, conn) {
        return vec![rejection];
    }

    // 4. MessageValidator
    if let Some(rejection) = message_validator(&parsed) {
        return vec![rejection];
    }

    // 5. EventValidator
    let parsed = match event_validator(parsed) {
        Ok(p) => p,
        Err(rejection) => return vec![rejection],
    };

    // 6. RelayPolicyValidator
    let parsed = match relay_policy_validator(parsed, conn, deps.config) {
        Ok(p) => p,
        Err(rejection) => return vec![rejection],
    };

    // 7 & 8. MessageHandler executes the effect; StorePolicy gates EVENT
    // effects from inside it (see message_handler's event branch).
    message_handler(parsed, conn, deps)
}

fn parse_frame(raw: &str) -> Result<Parsed, ()> {
    if has_disallowed_escapes(raw) {
        return Err(());
    }
    let value: Value = serde_json::from_str(raw).map_err(|_| ())?;
    let arr = value.as_array().ok_or(())?;
    let tag = arr.first().and_then(Value::as_str).ok_or(())?;

    let string_at = |i: usize| -> Option<String> { arr.get(i).and_then(Value::as_str).map(str::to_string) };

    match tag {
        "EVENT" if arr.len() == 2 => {
            let candidate = parse_event_candidate(&arr[1])?;
            Ok(Parsed::Event(candidate))
        }
        "EVENT" => Ok(Parsed::Unsupported), // relay-originated echo shape
        "REQ" => {
            let sub_id = string_at(1).ok_or(())?;
            let filters = arr.get(2..).unwrap_or(&[]).to_vec();
            Ok(Parsed::Req { sub_id, filters })
        }
        "COUNT" => {
            let sub_id = string_at(1).ok_or(())?;
            let filters = arr.get(2..).unwrap_or(&[]).to_vec();
            Ok(Parsed::Count { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = string_at(1).ok_or(())?;
            Ok(Parsed::Close { sub_id })
        }
        "AUTH" if arr.get(1).is_some_and(Value::is_object) => {
            let event: Event = serde_json::from_value(arr[1].clone()).map_err(|_| ())?;
            Ok(Parsed::Auth(event))
        }
        "AUTH" => Ok(Parsed::Unsupported), // relay-to-client challenge echo
        "NEG-OPEN" => {
            let sub_id = string_at(1).ok_or(())?;
            let filter = arr.get(2).cloned().unwrap_or(Value::Null);
            let initial_message = string_at(3).ok_or(())?;
            Ok(Parsed::NegOpen { sub_id, filter, initial_message })
        }
        "NEG-MSG" => {
            let sub_id = string_at(1).ok_or(())?;
            let message = string_at(2).ok_or(())?;
            Ok(Parsed::NegMsg { sub_id, message })
        }
        "NEG-CLOSE" => {
            let sub_id = string_at(1).ok_or(())?;
            Ok(Parsed::NegClose { sub_id })
        }
        "NOTICE" | "EOSE" | "OK" | "CLOSED" | "NEG-ERR" => Ok(Parsed::Unsupported),
        _ => Err(()),
    }
}

/// Rejects literal control characters (already rejected by a strict JSON
/// parser) and the policy-specific escape restrictions: `\q`, `\/`, and
/// `\uXXXX` for `XXXX < 0x20`.
fn has_disallowed_escapes(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'q' | b'/' => return true,
                b'u' if i + 5 < bytes.len() => {
                    if let Ok(code) = u32::from_str_radix(&raw[i + 2..i + 6], 16) {
                        if code < 0x20 {
                            return true;
                        }
                    }
                    i += 6;
                    continue;
                }
                _ => {}
            }
            i += 2;
            continue;
        }
        i += 1;
    }
    false
}

fn parse_event_candidate(value: &Value) -> Result<EventCandidate, ()> {
    let obj = value.as_object().ok_or(())?;
    let claimed_id = obj.get("id").and_then(Value::as_str).unwrap_or("").to_string();
    let pubkey = obj.get("pubkey").and_then(Value::as_str).unwrap_or("").to_string();
    let created_at = obj.get("created_at").and_then(|v| if v.is_i64() || v.is_u64() { v.as_i64() } else { None });
    let kind = obj.get("kind").and_then(Value::as_u64);
    let tags = obj
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_array())
                .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .collect()
        })
        .unwrap_or_default();
    let content = obj.get("content").and_then(Value::as_str).unwrap_or("").to_string();
    let sig = obj.get("sig").and_then(Value::as_str).unwrap_or("").to_string();
    Ok(EventCandidate { claimed_id, pubkey, created_at, kind, tags, content, sig })
}

fn ok_rejection(event_id: &str, message: impl Into<String>) -> RelayMessage {
    RelayMessage::Ok { event_id: event_id.to_string(), accepted: false, message: message.into() }
}

fn closed_rejection(sub_id: &str, message: impl Into<String>) -> RelayMessage {
    RelayMessage::Closed { sub_id: sub_id.to_string(), message: message.into() }
}

fn auth_enforcer(parsed: &Parsed, conn: &ConnectionState) -> Option<RelayMessage> {
    if !conn.auth_required || conn.is_authenticated() {
        return None;
    }
    match parsed {
        Parsed::Event(candidate) => Some(ok_rejection(&candidate.claimed_id, "auth-required: authentication required")),
        Parsed::Req { sub_id, .. } | Parsed::Count { sub_id, .. } => {
            Some(closed_rejection(sub_id, "auth-required: authentication required"))
        }
        _ => None,
    }
}

fn message_validator(parsed: &Parsed) -> Option<RelayMessage> {
    match parsed {
        Parsed::Unsupported => Some(RelayMessage::Notice { message: "invalid: unsupported_message_type".to_string() }),
        Parsed::Req { sub_id, filters } if filters.is_empty() => {
            Some(closed_rejection(sub_id, "invalid: at least one filter is required"))
        }
        Parsed::Count { sub_id, filters } if filters.is_empty() => {
            Some(closed_rejection(sub_id, "invalid: at least one filter is required"))
        }
        _ => None,
    }
}

fn event_validator(parsed: Parsed) -> Result<Parsed, RelayMessage> {
    let candidate = match parsed {
        Parsed::Event(candidate) => candidate,
        other => return Ok(other),
    };

    let Some(created_at) = candidate.created_at else {
        return Err(ok_rejection(&candidate.claimed_id, "invalid: invalid created_at"));
    };
    let Some(kind) = candidate.kind else {
        return Err(ok_rejection(&candidate.claimed_id, "invalid: invalid event kind"));
    };

    let unsigned = UnsignedEvent {
        pubkey: candidate.pubkey.clone(),
        created_at,
        kind,
        tags: candidate.tags.clone(),
        content: candidate.content.clone(),
    };
    let expected_id = nostr::get_event_hash(&unsigned).map_err(|_| ok_rejection(&candidate.claimed_id, "invalid: invalid event id"))?;
    if expected_id != candidate.claimed_id {
        return Err(ok_rejection(&candidate.claimed_id, "invalid: invalid event id"));
    }

    let event = Event {
        id: expected_id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: candidate.sig,
    };

    match nostr::verify_event(&event) {
        Ok(true) => Ok(Parsed::Event(EventCandidate {
            claimed_id: event.id,
            pubkey: event.pubkey,
            created_at: Some(event.created_at),
            kind: Some(event.kind),
            tags: event.tags,
            content: event.content,
            sig: event.sig,
        })),
        _ => Err(ok_rejection(&candidate.claimed_id, "invalid: invalid event signature")),
    }
}

fn relay_policy_validator(parsed: Parsed, conn: &ConnectionState, config: &RelayConfig) -> Result<Parsed, RelayMessage> {
    let limitation = &config.limitation;
    match parsed {
        Parsed::Event(candidate) => {
            let now = current_unix_time();
            if limitation.created_at_lower_limit > 0 && candidate.created_at.unwrap_or(now) < now - limitation.created_at_lower_limit {
                return Err(ok_rejection(&candidate.claimed_id, "invalid: created_at too far in the past"));
            }
            if limitation.created_at_upper_limit > 0 && candidate.created_at.unwrap_or(now) > now + limitation.created_at_upper_limit {
                return Err(ok_rejection(&candidate.claimed_id, "invalid: created_at too far in the future"));
            }
            if candidate.tags.len() > limitation.max_event_tags {
                return Err(ok_rejection(&candidate.claimed_id, "invalid: too many tags"));
            }
            if candidate.content.chars().count() > limitation.max_content_length {
                return Err(ok_rejection(&candidate.claimed_id, "invalid: content too long"));
            }
            if limitation.min_pow_difficulty > 0 {
                check_pow(&candidate, limitation.min_pow_difficulty)?;
            }
            check_pubkey_policy(&candidate, &config.auth)?;
            Ok(Parsed::Event(candidate))
        }
        Parsed::Req { sub_id, filters } => {
            if limitation.max_subid_length > 0 && sub_id.len() > limitation.max_subid_length {
                return Err(closed_rejection(&sub_id, "restricted: subscription id too long"));
            }
            if limitation.max_subscriptions > 0
                && !conn.subscriptions.contains_key(&sub_id)
                && conn.subscriptions.len() >= limitation.max_subscriptions
            {
                return Err(closed_rejection(&sub_id, "restricted: max subscriptions reached"));
            }
            let filters = apply_filter_policy(&sub_id, filters, config)?;
            Ok(Parsed::Req { sub_id, filters })
        }
        Parsed::Count { sub_id, filters } => {
            if limitation.max_subid_length > 0 && sub_id.len() > limitation.max_subid_length {
                return Err(closed_rejection(&sub_id, "restricted: subscription id too long"));
            }
            let filters = apply_filter_policy(&sub_id, filters, config)?;
            Ok(Parsed::Count { sub_id, filters })
        }
        Parsed::Close { sub_id } => {
            if limitation.max_subid_length > 0 && sub_id.len() > limitation.max_subid_length {
                return Err(closed_rejection(&sub_id, "restricted: subscription id too long"));
            }
            Ok(Parsed::Close { sub_id })
        }
        other => Ok(other),
    }
}

fn apply_filter_policy(sub_id: &str, raw_filters: Vec<Value>, config: &RelayConfig) -> Result<Vec<Value>, RelayMessage> {
    let min_prefix = config.relay_policy.min_prefix_length;
    for raw in &raw_filters {
        let filter = Filter::from_json_value(raw).map_err(|_| closed_rejection(sub_id, "invalid: invalid filter"))?;
        if filter.validate().is_err() {
            return Err(closed_rejection(sub_id, "invalid: invalid filter"));
        }
        if min_prefix > 0 {
            if let Some(len) = filter.shortest_prefix_length() {
                if len < 64 && len < min_prefix {
                    return Err(closed_rejection(sub_id, "restricted: prefix too short"));
                }
            }
        }
    }
    Ok(raw_filters)
}

/// `auth.mode` gates which authors may publish, independent of whether
/// authentication is actually required: `whitelist` accepts only listed
/// pubkeys, `denylist` rejects listed ones, `none` doesn't gate at all.
fn check_pubkey_policy(candidate: &EventCandidate, auth: &crate::config::AuthConfig) -> Result<(), RelayMessage> {
    match auth.mode {
        crate::config::AuthMode::None => Ok(()),
        crate::config::AuthMode::Whitelist if auth.whitelist.iter().any(|pk| pk == &candidate.pubkey) => Ok(()),
        crate::config::AuthMode::Whitelist => {
            Err(ok_rejection(&candidate.claimed_id, "blocked: pubkey is not on the whitelist"))
        }
        crate::config::AuthMode::Denylist if auth.denylist.iter().any(|pk| pk == &candidate.pubkey) => {
            Err(ok_rejection(&candidate.claimed_id, "blocked: pubkey is denied"))
        }
        crate::config::AuthMode::Denylist => Ok(()),
    }
}

fn check_pow(candidate: &EventCandidate, min_difficulty: u32) -> Result<(), RelayMessage> {
    let committed_target = candidate
        .tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("nonce") && t.len() > 2)
        .and_then(|t| t[2].parse::<u32>().ok())
        .unwrap_or(0);

    if committed_target < min_difficulty {
        return Err(ok_rejection(
            &candidate.claimed_id,
            format!("pow: committed target {committed_target} is less than {min_difficulty}"),
        ));
    }

    let actual_difficulty = leading_zero_bits_hex(&candidate.claimed_id);
    if actual_difficulty < committed_target {
        return Err(ok_rejection(
            &candidate.claimed_id,
            format!("pow: actual difficulty {actual_difficulty} is less than committed target {committed_target}"),
        ));
    }
    Ok(())
}

fn leading_zero_bits_hex(hex_str: &str) -> u32 {
    let Ok(bytes) = hex::decode(hex_str) else { return 0 };
    let mut count = 0u32;
    for byte in bytes {
        if byte == 0 {
            count += 8;
            continue;
        }
        count += byte.leading_zeros();
        break;
    }
    count
}

fn current_unix_time() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

fn message_handler(parsed: Parsed, conn: &mut ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    match parsed {
        Parsed::Event(candidate) => handle_event(candidate, conn, deps),
        Parsed::Req { sub_id, filters } => handle_req(sub_id, filters, conn, deps),
        Parsed::Count { sub_id, filters } => handle_count(sub_id, filters, conn, deps),
        Parsed::Close { sub_id } => {
            conn.subscriptions.remove(&sub_id);
            Vec::new()
        }
        Parsed::Auth(event) => handle_auth(event, conn, deps),
        Parsed::NegOpen { sub_id, .. } => vec![RelayMessage::NegMsg { sub_id, message: String::new() }],
        Parsed::NegMsg { sub_id, .. } => vec![RelayMessage::NegMsg { sub_id, message: String::new() }],
        Parsed::NegClose { .. } => Vec::new(),
        Parsed::Unsupported => Vec::new(),
    }
}

fn handle_event(candidate: EventCandidate, conn: &mut ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    let event = Event {
        id: candidate.claimed_id.clone(),
        pubkey: candidate.pubkey,
        created_at: candidate.created_at.unwrap_or_default(),
        kind: candidate.kind.unwrap_or_default(),
        tags: candidate.tags,
        content: candidate.content,
        sig: candidate.sig,
    };

    // 8. StorePolicy: NIP-09 / NIP-59 / NIP-70 gate the actual insert.
    if let Some(reason) = store_policy_check(&event, conn, deps.store) {
        return vec![ok_rejection(&event.id, reason)];
    }

    match deps.store.insert_event(&event) {
        Ok(InsertOutcome::Inserted) => {
            deps.bus.publish(event.clone());
            vec![RelayMessage::Ok { event_id: event.id, accepted: true, message: "event accepted".to_string() }]
        }
        Ok(InsertOutcome::Duplicate) => {
            vec![RelayMessage::Ok { event_id: event.id, accepted: true, message: "duplicate: already have this event".to_string() }]
        }
        Err(err) => {
            debug!(error = %err, "store insert failed");
            vec![ok_rejection(&event.id, "error: could not store event")]
        }
    }
}

fn store_policy_check(event: &Event, conn: &ConnectionState, store: &Database) -> Option<String> {
    if event.kind == nostr::KIND_DELETION {
        for target_id in event.tag_values("e") {
            if let Ok(Some(author)) = store.lookup_author(target_id) {
                if author != event.pubkey {
                    return Some("invalid: cannot delete another author's event".to_string());
                }
            }
        }
        for coord in event.tag_values("a") {
            if let Some(pubkey) = coord.splitn(3, ':').nth(1) {
                if pubkey != event.pubkey {
                    return Some("invalid: cannot delete another author's event".to_string());
                }
            }
        }
    }

    if event.kind == nostr::KIND_GIFT_WRAP {
        let p_tags: Vec<&str> = event.tag_values("p").collect();
        if p_tags.is_empty() || p_tags.iter().any(|p| !is_valid_hex_pubkey(p)) {
            return Some("invalid: gift-wrap requires valid p tags".to_string());
        }
    }

    let is_protected = event.tags.iter().any(|t| t.len() == 1 && t[0] == "-");
    if is_protected && !conn.authenticated_pubkeys.contains(&event.pubkey) {
        return Some("restricted: auth-required, protected event requires authentication as its author".to_string());
    }

    None
}

fn is_valid_hex_pubkey(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn handle_req(sub_id: String, raw_filters: Vec<Value>, conn: &mut ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    let filters = match build_filters(&raw_filters, deps.config) {
        Ok(f) => f,
        Err(_) => return vec![closed_rejection(&sub_id, "invalid: invalid filter")],
    };

    conn.subscriptions.insert(sub_id.clone(), filters.clone());

    let opts = QueryOptions {
        gift_wrap_recipients: Some(conn.authenticated_pubkeys.iter().cloned().collect()),
        group_viewer_pubkeys: None,
    };
    let mut frames = match deps.store.query_events(&filters, &opts) {
        Ok(events) => events.into_iter().map(|event| RelayMessage::Event { sub_id: sub_id.clone(), event }).collect(),
        Err(_) => Vec::new(),
    };
    frames.push(RelayMessage::Eose { sub_id });
    frames
}

fn handle_count(sub_id: String, raw_filters: Vec<Value>, conn: &ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    let filters = match build_filters(&raw_filters, deps.config) {
        Ok(f) => f,
        Err(_) => return vec![closed_rejection(&sub_id, "invalid: invalid filter")],
    };

    let opts = QueryOptions {
        gift_wrap_recipients: Some(conn.authenticated_pubkeys.iter().cloned().collect()),
        group_viewer_pubkeys: None,
    };

    let count = match deps.store.count_events(&filters, &opts) {
        Ok(c) => c,
        Err(_) => return vec![closed_rejection(&sub_id, "error: count failed")],
    };

    let hll = single_tag_constraint_value(&filters).map(|value| {
        let events = deps.store.query_events(&filters, &opts).unwrap_or_default();
        let offset = nostr::hll::derive_offset(value);
        let mut sketch = nostr::hll::Hll::new(offset);
        for event in &events {
            if let Some(bytes) = nostr::hll::pubkey_bytes(&event.pubkey) {
                sketch.add_pubkey(&bytes);
            }
        }
        hex::encode(sketch.registers())
    });

    vec![RelayMessage::Count { sub_id, count, hll }]
}

/// If exactly one filter with exactly one single-letter tag constraint
/// (whose value list has exactly one entry) is present, returns that value
/// so a count reply can attach an HLL sketch.
fn single_tag_constraint_value(filters: &[Filter]) -> Option<&str> {
    if filters.len() != 1 {
        return None;
    }
    let tags = filters[0].tags.as_ref()?;
    if tags.len() != 1 {
        return None;
    }
    let (_, values) = tags.iter().next()?;
    if values.len() != 1 {
        return None;
    }
    Some(values[0].as_str())
}

fn build_filters(raw_filters: &[Value], config: &RelayConfig) -> Result<Vec<Filter>, ()> {
    raw_filters
        .iter()
        .map(|raw| {
            let mut filter = Filter::from_json_value(raw).map_err(|_| ())?;
            filter.limit = Some(match filter.limit {
                None => config.limitation.default_limit,
                Some(limit) if config.limitation.max_limit > 0 => limit.min(config.limitation.max_limit),
                Some(limit) => limit,
            });
            Ok(filter)
        })
        .collect()
}

fn handle_auth(event: Event, conn: &mut ConnectionState, deps: &PipelineDeps) -> Vec<RelayMessage> {
    let now = current_unix_time();
    let relay_url = deps.config.expected_relay_url();
    let max_clock_skew = deps.config.auth.timeout_seconds as i64;
    match nostr::validate_auth_event(&event, &conn.challenge, &relay_url, now, max_clock_skew) {
        Ok(true) => {
            conn.authenticated_pubkeys.insert(event.pubkey.clone());
            vec![RelayMessage::Ok { event_id: event.id, accepted: true, message: String::new() }]
        }
        _ => vec![ok_rejection(&event.id, "error: invalid auth event")],
    }
}
