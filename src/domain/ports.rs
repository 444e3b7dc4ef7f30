use crate::domain::errors::CredentialError;
use async_trait::async_trait;

/// A currently valid credential pair for the feed.
#[derive(Debug, Clone)]
pub struct FeedCredentials {
    pub token: String,
    pub client_id: String,
}

/// Boundary to credential acquisition and renewal, which live outside this
/// system. The core only ever asks for a currently valid pair and whether
/// it has been rotated externally.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a credential pair that is valid right now.
    async fn valid_token(&self) -> Result<FeedCredentials, CredentialError>;

    /// True when the credentials have changed since the last `valid_token`
    /// call, e.g. renewed by an external process.
    async fn has_changed(&self) -> bool;
}
