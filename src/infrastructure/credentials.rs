//! File-backed credential provider.
//!
//! Token acquisition and renewal run in a separate process that rewrites
//! the token file; this side only reads it. `has_changed` notices external
//! rotation so the session can signal its connections to reconnect.

use crate::domain::errors::CredentialError;
use crate::domain::ports::{CredentialProvider, FeedCredentials};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Warn (but still hand out the token) when expiry is this close.
const EXPIRY_WARN_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: Option<String>,
    client_id: Option<String>,
    expires_at: Option<i64>,
}

pub struct FileCredentialProvider {
    path: PathBuf,
    last_issued: Mutex<Option<String>>,
}

impl FileCredentialProvider {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_issued: Mutex::new(None),
        }
    }

    async fn read_file(&self) -> Result<TokenFile, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CredentialError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn valid_token(&self) -> Result<FeedCredentials, CredentialError> {
        let file = self.read_file().await?;

        let token = file
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(CredentialError::MissingField {
                field: "access_token",
            })?;
        let client_id = file
            .client_id
            .filter(|c| !c.is_empty())
            .ok_or(CredentialError::MissingField { field: "client_id" })?;

        if let Some(expires_at) = file.expires_at {
            let remaining = expires_at - Utc::now().timestamp();
            if remaining <= 0 {
                return Err(CredentialError::Expired {
                    ago_secs: -remaining,
                });
            }
            if remaining <= EXPIRY_WARN_SECS {
                warn!(
                    "Token expires in {}s; expecting external renewal",
                    remaining
                );
            }
        }

        *self.last_issued.lock().expect("credential mutex poisoned") = Some(token.clone());
        Ok(FeedCredentials { token, client_id })
    }

    async fn has_changed(&self) -> bool {
        let on_disk = match self.read_file().await {
            Ok(file) => file.access_token,
            Err(_) => return false,
        };
        let Some(on_disk) = on_disk else {
            return false;
        };
        let last = self.last_issued.lock().expect("credential mutex poisoned");
        match last.as_deref() {
            Some(issued) => issued != on_disk.as_str(),
            None => false,
        }
    }
}
