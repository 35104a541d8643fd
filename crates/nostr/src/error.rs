use thiserror::Error;

/// Errors produced by event construction, signing, and verification.
#[derive(Debug, Error)]
pub enum NostrError {
    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hex decode failed: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("malformed event id or signature hex")]
    MalformedHex,

    #[error("unsupported wire message kind: {0}")]
    UnknownMessageKind(String),

    #[error("wire frame was not a JSON array")]
    NotAnArray,

    #[error("wire frame array was empty")]
    EmptyFrame,
}

pub type Result<T> = std::result::Result<T, NostrError>;
