use thiserror::Error;

/// Error taxonomy for the relay core, named after the kinds in the protocol's
/// error handling design rather than after Rust types.
#[derive(Debug, Error)]
pub enum RelayError {
    // Transport
    #[error("transport error: {0}")]
    Transport(String),
    #[error("websocket upgrade failed: {0}")]
    UpgradeError(String),

    // Storage
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    // Config
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Codec
    #[error(transparent)]
    Nostr(#[from] nostr::NostrError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// The result of a single pipeline stage: either the context moves forward,
/// or the frame is rejected with a reason and whatever frames the stage
/// already queued in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    Error,
}
