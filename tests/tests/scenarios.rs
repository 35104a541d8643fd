//! Covers the remaining black-box scenarios: PoW rejection and a COUNT
//! round trip against a spawned relay.

mod common;

use std::time::Duration;

use nostr::{finalize_event, generate_secret_key, get_public_key_hex, EventTemplate, KIND_SHORT_TEXT_NOTE};
use nostr_client::RelayConnection;
use nostr_relay::AuthMode;
use url::Url;

use common::{next_test_port, start_test_relay, test_relay_config, test_relay_url};

#[tokio::test]
async fn pow_below_committed_difficulty_is_rejected() {
    let mut config = test_relay_config(next_test_port());
    config.limitation.min_pow_difficulty = 20;
    let (_server, addr, _dir) = start_test_relay(config).await;

    let url = Url::parse(&test_relay_url(addr.port())).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let sk = generate_secret_key();
    let event = finalize_event(&EventTemplate { created_at: 1_700_000_010, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "cheap".into() }, &sk)
        .unwrap();

    let confirmation = conn.publish_event(event, Duration::from_secs(2)).await.unwrap();
    assert!(!confirmation.accepted);
    assert!(confirmation.message.starts_with("pow:"), "got: {}", confirmation.message);
}

#[tokio::test]
async fn count_reports_the_number_of_stored_matching_events() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let sk = generate_secret_key();
    for i in 0..3 {
        let event = finalize_event(
            &EventTemplate { created_at: 1_700_000_020 + i, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: format!("note {i}") },
            &sk,
        )
        .unwrap();
        let confirmation = conn.publish_event(event, Duration::from_secs(2)).await.unwrap();
        assert!(confirmation.accepted);
    }

    let filter = serde_json::json!({ "kinds": [KIND_SHORT_TEXT_NOTE] });
    let result = conn.count("count-1".to_string(), vec![filter], Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.count, 3);
}

#[tokio::test]
async fn denylisted_pubkey_is_blocked() {
    let sk = generate_secret_key();
    let pubkey = get_public_key_hex(&sk).unwrap();

    let mut config = test_relay_config(next_test_port());
    config.auth.mode = AuthMode::Denylist;
    config.auth.denylist = vec![pubkey];
    let (_server, addr, _dir) = start_test_relay(config).await;

    let url = Url::parse(&test_relay_url(addr.port())).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let event = finalize_event(&EventTemplate { created_at: 1_700_000_040, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "hello".into() }, &sk)
        .unwrap();
    let confirmation = conn.publish_event(event, Duration::from_secs(2)).await.unwrap();
    assert!(!confirmation.accepted);
    assert!(confirmation.message.starts_with("blocked:"), "got: {}", confirmation.message);
}

#[tokio::test]
async fn whitelist_mode_rejects_pubkeys_not_listed() {
    let other_sk = generate_secret_key();
    let other_pubkey = get_public_key_hex(&other_sk).unwrap();

    let mut config = test_relay_config(next_test_port());
    config.auth.mode = AuthMode::Whitelist;
    config.auth.whitelist = vec![other_pubkey];
    let (_server, addr, _dir) = start_test_relay(config).await;

    let url = Url::parse(&test_relay_url(addr.port())).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let sk = generate_secret_key();
    let event = finalize_event(&EventTemplate { created_at: 1_700_000_050, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "not listed".into() }, &sk)
        .unwrap();
    let confirmation = conn.publish_event(event, Duration::from_secs(2)).await.unwrap();
    assert!(!confirmation.accepted);
    assert!(confirmation.message.starts_with("blocked:"), "got: {}", confirmation.message);
}
