//! Black-box tests driving `nostr-client` against a spawned `RelayServer`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nostr::{finalize_event, generate_secret_key, get_public_key_hex, EventTemplate, KIND_SHORT_TEXT_NOTE};
use nostr_client::RelayConnection;
use url::Url;

use common::{next_test_port, start_test_relay, test_relay_config, test_relay_url};

#[tokio::test]
async fn publish_then_subscribe_round_trip() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let sk = generate_secret_key();
    let event = finalize_event(&EventTemplate { created_at: 1_700_000_000, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "hello".into() }, &sk)
        .unwrap();

    let confirmation = conn.publish_event(event.clone(), Duration::from_secs(2)).await.unwrap();
    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, event.id);

    let filter = serde_json::json!({ "kinds": [KIND_SHORT_TEXT_NOTE] });
    let mut rx = conn.subscribe("sub-1".to_string(), vec![filter]).await.unwrap();

    let mut saw_eose = false;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(nostr_client::SubscriptionEvent::Eose)) => {
                saw_eose = true;
                break;
            }
            Ok(Some(nostr_client::SubscriptionEvent::Event(received))) => {
                assert_eq!(received.id, event.id);
            }
            other => panic!("unexpected subscription event: {other:?}"),
        }
    }
    assert!(saw_eose, "expected an EOSE after replaying stored events");
}

#[tokio::test]
async fn duplicate_publish_is_ok_but_not_inserted_twice() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let sk = generate_secret_key();
    let event = finalize_event(&EventTemplate { created_at: 1_700_000_001, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: "once".into() }, &sk)
        .unwrap();

    let first = conn.publish_event(event.clone(), Duration::from_secs(2)).await.unwrap();
    assert!(first.accepted);

    let second = conn.publish_event(event.clone(), Duration::from_secs(2)).await.unwrap();
    assert!(second.accepted);
    assert!(second.message.starts_with("duplicate:"));
}

#[tokio::test]
async fn malformed_frame_does_not_kill_the_connection() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(test_relay_url(port)).await.unwrap();
    use futures_util::{SinkExt, StreamExt};

    // First frame off the wire is the AUTH challenge.
    let _ = ws.next().await;

    ws.send(tokio_tungstenite::tungstenite::Message::Text("not json".into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let text = reply.into_text().unwrap();
    assert!(text.contains("NOTICE"), "expected a NOTICE frame for a malformed message, got: {text}");

    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        serde_json::json!(["REQ", "still-alive", {}]).to_string().into(),
    ))
    .await
    .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    assert!(reply.into_text().unwrap().contains("EOSE"));
}

#[tokio::test]
async fn max_subscriptions_closes_with_reason() {
    let mut config = test_relay_config(next_test_port());
    config.limitation.max_subscriptions = 1;
    let (_server, _addr, _dir) = start_test_relay(config).await;

    let url = Url::parse(&test_relay_url(_addr.port())).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let filter = serde_json::json!({});
    let _rx1 = conn.subscribe("sub-a".to_string(), vec![filter.clone()]).await.unwrap();

    let mut rx2 = conn.subscribe("sub-b".to_string(), vec![filter]).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(2), rx2.recv()).await.unwrap().unwrap() {
        nostr_client::SubscriptionEvent::Closed(reason) => assert!(reason.starts_with("restricted:")),
        other => panic!("expected Closed, got {other:?}"),
    }
}

#[tokio::test]
async fn nip42_auth_round_trip_retries_a_restricted_publish() {
    let mut config = test_relay_config(next_test_port());
    config.auth.required = false;
    let (_server, addr, _dir) = start_test_relay(config).await;

    let sk = generate_secret_key();
    let pubkey = get_public_key_hex(&sk).unwrap();
    let signer = Arc::new(nostr_client::KeypairSigner::new(sk));

    let url = Url::parse(&test_relay_url(addr.port())).unwrap();
    let conn = RelayConnection::new(url, Some(signer));
    conn.connect().await.unwrap();

    // A protected (NIP-70) event is rejected unless authenticated as its author.
    let protected = finalize_event(
        &EventTemplate {
            created_at: 1_700_000_002,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![vec!["-".to_string()]],
            content: "mine only".into(),
        },
        &sk,
    )
    .unwrap();
    assert_eq!(protected.pubkey, pubkey);

    let confirmation = conn.publish_event(protected, Duration::from_secs(2)).await.unwrap();
    assert!(confirmation.accepted, "auto-auth should retry and succeed: {}", confirmation.message);
}

/// Scenario S6: a client with a signer authenticates proactively off the
/// relay's unsolicited `["AUTH", challenge]`, without ever publishing.
#[tokio::test]
async fn proactive_auth_succeeds_without_a_publish() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let sk = generate_secret_key();
    let signer = Arc::new(nostr_client::KeypairSigner::new(sk));

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, Some(signer));
    conn.connect().await.unwrap();

    conn.authenticate(Duration::from_secs(2)).await.unwrap();
}

/// A second `authenticate()` call, once already authenticated, resolves
/// immediately without starting another round.
#[tokio::test]
async fn authenticate_is_idempotent() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let sk = generate_secret_key();
    let signer = Arc::new(nostr_client::KeypairSigner::new(sk));

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, Some(signer));
    conn.connect().await.unwrap();

    conn.authenticate(Duration::from_secs(2)).await.unwrap();
    conn.authenticate(Duration::from_secs(2)).await.unwrap();
}

/// Without a signer, `authenticate()` fails with `invalid signer` rather
/// than hanging.
#[tokio::test]
async fn authenticate_without_a_signer_fails() {
    let port = next_test_port();
    let (_server, _addr, _dir) = start_test_relay(test_relay_config(port)).await;

    let url = Url::parse(&test_relay_url(port)).unwrap();
    let conn = RelayConnection::new(url, None);
    conn.connect().await.unwrap();

    let err = conn.authenticate(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, nostr_client::ClientError::InvalidSigner));
}
