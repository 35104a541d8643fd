//! Exercises `SessionManager` and `MultiRelaySession` against two spawned
//! relays.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nostr::{finalize_event, generate_secret_key, EventTemplate, KIND_SHORT_TEXT_NOTE};
use nostr_client::{MultiRelaySession, RelayMode, SessionManager, SessionOptions};
use url::Url;

use common::{next_test_port, start_test_relay, test_relay_config, test_relay_url};

#[tokio::test]
async fn session_manager_deduplicates_by_relay_and_pubkey() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let manager = SessionManager::new();
    let relay_url = test_relay_url(port);
    let pubkey = "a".repeat(64);

    let opts_a = SessionOptions { pubkey: Some(pubkey.clone()), signer: None, notify: None };
    let opts_b = SessionOptions { pubkey: Some(pubkey.clone()), signer: None, notify: None };

    let first = manager.get_or_start_session(&relay_url, opts_a).await.unwrap();
    let second = manager.get_or_start_session(&relay_url, opts_b).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn multi_relay_session_publishes_to_read_write_members_only() {
    let port_a = next_test_port();
    let port_b = next_test_port();
    let (_server_a, addr_a, _dir_a) = start_test_relay(test_relay_config(port_a)).await;
    let (_server_b, addr_b, _dir_b) = start_test_relay(test_relay_config(port_b)).await;

    let (session, _events) = MultiRelaySession::new();
    session.add_relay(Url::parse(&test_relay_url(addr_a.port())).unwrap(), RelayMode::ReadWrite, None).await.unwrap();
    session.add_relay(Url::parse(&test_relay_url(addr_b.port())).unwrap(), RelayMode::Read, None).await.unwrap();

    let relays = session.list_relays().await;
    assert_eq!(relays.len(), 2);

    let sk = generate_secret_key();
    let event = finalize_event(&EventTemplate { created_at: 1_700_000_030, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "fan out".into() }, &sk)
        .unwrap();

    let results = session.publish(event, Duration::from_secs(2)).await.unwrap();
    assert_eq!(results.len(), 1, "only the read_write member should receive the publish");
    assert!(results.values().next().unwrap().as_ref().unwrap().accepted);
}
