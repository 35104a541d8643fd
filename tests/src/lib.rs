//! No public API; this crate exists only to host `tests/` black-box
//! integration tests that drive `nostr-client` against a spawned
//! `nostr-relay` server.
