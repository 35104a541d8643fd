use thiserror::Error;

/// Error taxonomy for the client session manager and relay workers, named
/// after the kinds in the protocol's error handling design rather than
/// after Rust types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    // Transport
    #[error("connect error: {0}")]
    ConnectError(String),
    #[error("upgrade error: {0}")]
    UpgradeError(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("remote closed: {code} {reason}")]
    RemoteClose { code: u16, reason: String },

    // Client-request
    #[error("not connected")]
    NotConnected,
    #[error("a publish for this event id is already pending")]
    PublishAlreadyPending,
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("invalid signer")]
    InvalidSigner,
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),
    #[error("invalid pubkey: {0}")]
    InvalidPubkey(String),
    #[error("invalid filters")]
    InvalidFilters,
    #[error("no writable relays")]
    NoWritableRelays,
    #[error("no readable relays")]
    NoReadableRelays,
    #[error("a NEG-MSG for this sub_id is already pending")]
    NegMsgAlreadyPending,
    #[error("negentropy session is not open for this sub_id")]
    NegNotOpen,
    #[error("negentropy error ({class}): {message}")]
    NegErr { class: String, message: String },
    #[error("negentropy session closed: replaced = {replaced}")]
    NegClosed { replaced: bool },
    #[error("subscription id already taken by a different subscriber")]
    SubIdTaken,
    #[error("session stopped: {reason}")]
    SessionStopped { reason: String },
    #[error("session down: {reason}")]
    SessionDown { reason: String },
    #[error("request timed out")]
    Timeout,
}
