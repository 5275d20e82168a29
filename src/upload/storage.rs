use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::config::container_type;
use crate::error::StorageError;

/// Opaque handle to a stored object, later resolved to a signed URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageReference(String);

impl StorageReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Fail with `AlreadyExists` if something is stored at the path.
    CreateNew,
    Overwrite,
}

/// Object storage collaborator.
#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        mode: WriteMode,
    ) -> Result<StorageReference, StorageError>;

    /// Time-limited download link. Used by the review surface only.
    async fn signed_url(
        &self,
        reference: &StorageReference,
        expiry: Duration,
    ) -> Result<SignedUrl, StorageError>;
}

/// Where an upload attempt lands: `{user}/{campaign}/{random}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DestinationKey(String);

impl DestinationKey {
    /// A fresh key per attempt, so a retry never collides with an earlier
    /// partial upload.
    pub fn for_attempt(user_id: &str, campaign_id: &str, mime_type: &str) -> Self {
        Self::with_name(user_id, campaign_id, &Uuid::new_v4().to_string(), mime_type)
    }

    pub fn with_name(user_id: &str, campaign_id: &str, name: &str, mime_type: &str) -> Self {
        Self(format!(
            "{}/{}/{}.{}",
            user_id,
            campaign_id,
            name,
            extension_for(mime_type)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn extension_for(mime_type: &str) -> &'static str {
    match container_type(mime_type) {
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        _ => "bin",
    }
}
