use thiserror::Error;

/// Errors raised while decoding binary feed frames.
///
/// Decode failures never abort a connection: they are counted, logged a
/// bounded number of times, and the frame is dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes (expected at least {min})")]
    TooShort { len: usize, min: usize },

    #[error("unexpected marker byte {found} (expected {expected})")]
    WrongMarker { found: u8, expected: u8 },

    #[error("frame truncated while reading {field}")]
    Truncated { field: &'static str },
}

/// Errors related to the feed transport.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("rate limited by feed: {detail}")]
    RateLimited { detail: String },
}

impl FeedError {
    /// Classify a transport error: rate-limit signals get their own variant
    /// because they trigger a long cool-down instead of exponential backoff.
    pub fn from_transport(err: impl std::fmt::Display) -> Self {
        let detail = err.to_string();
        if is_rate_limit(&detail) {
            FeedError::RateLimited { detail }
        } else {
            FeedError::ConnectionLost { reason: detail }
        }
    }
}

/// Upstream signals a block either with an HTTP 429 during the handshake or
/// a message mentioning the block.
pub fn is_rate_limit(message: &str) -> bool {
    message.contains("429")
        || message.contains("Too many requests")
        || message.to_lowercase().contains("blocked")
}

/// Errors from the credential provider.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token file missing field: {field}")]
    MissingField { field: &'static str },

    #[error("token expired {ago_secs}s ago")]
    Expired { ago_secs: i64 },

    #[error("failed to read token file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed token file: {0}")]
    Malformed(#[from] serde_json::Error),
}
