use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::upload::storage::{SignedUrl, StoragePort, StorageReference, WriteMode};

type HmacSha256 = Hmac<Sha256>;

/// Longest lifetime a signed link may have.
pub const MAX_LINK_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Filesystem-backed object store with signed, expiring download links.
pub struct LocalStorage {
    root: PathBuf,
    base_url: String,
    secret: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self {
            root,
            base_url,
            secret: secret.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        let root = config.root.clone().unwrap_or_else(default_root);
        let mut storage = Self::new(root, config.signing_secret.clone());
        if let Some(base_url) = &config.public_base_url {
            storage.base_url = base_url.trim_end_matches('/').to_string();
        }
        storage
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks a link produced by [`StoragePort::signed_url`].
    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> Result<(), StorageError> {
        if Utc::now().timestamp() > expires {
            return Err(StorageError::Denied(format!("link for {} has expired", path)));
        }
        let denied = || StorageError::Denied(format!("bad signature for {}", path));
        let signature = decode_hex(signature).ok_or_else(denied)?;
        self.mac(path, expires)?
            .verify_slice(&signature)
            .map_err(|_| denied())
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256, StorageError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|err| StorageError::Denied(format!("signing key rejected: {}", err)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn sign(&self, path: &str, expires: i64) -> Result<String, StorageError> {
        Ok(format!("{:x}", self.mac(path, expires)?.finalize().into_bytes()))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let clean = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 || !raw.is_ascii() {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

/// `<data dir>/BountyCapture/recordings`
pub fn default_root() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("BountyCapture");
    path.push("recordings");
    path
}

#[async_trait]
impl StoragePort for LocalStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        mode: WriteMode,
    ) -> Result<StorageReference, StorageError> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;
        if mode == WriteMode::CreateNew && tokio::fs::try_exists(&target).await? {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }

        // Bytes go to a sibling temp file that is deleted on drop, so a
        // failed or cancelled put never leaves a partial object at `target`.
        let staged = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(parent)?;
        let mut file = tokio::fs::File::from_std(staged.reopen()?);
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let persisted = match mode {
            WriteMode::CreateNew => staged.persist_noclobber(&target),
            WriteMode::Overwrite => staged.persist(&target),
        };
        if let Err(err) = persisted {
            // `err.file` is dropped here, removing the staged copy.
            return Err(match err.error.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
                _ => err.error.into(),
            });
        }

        info!(
            "Stored {} ({} bytes, {}) under {}",
            path,
            bytes.len(),
            content_type,
            self.root.display()
        );
        Ok(StorageReference::new(path))
    }

    async fn signed_url(
        &self,
        reference: &StorageReference,
        expiry: Duration,
    ) -> Result<SignedUrl, StorageError> {
        let target = self.resolve(reference.as_str())?;
        if !tokio::fs::try_exists(&target).await? {
            return Err(StorageError::NotFound(reference.to_string()));
        }
        if expiry.is_zero() || expiry > MAX_LINK_EXPIRY {
            warn!("Refusing to sign {} for {}s", reference, expiry.as_secs());
            return Err(StorageError::Denied(format!(
                "link expiry must be between 1s and {}s, got {}s",
                MAX_LINK_EXPIRY.as_secs(),
                expiry.as_secs()
            )));
        }
        let expires = i64::try_from(expiry.as_secs())
            .ok()
            .and_then(|secs| Utc::now().timestamp().checked_add(secs))
            .ok_or_else(|| StorageError::Denied(format!("expiry {}s overflows", expiry.as_secs())))?;
        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| StorageError::Denied(format!("invalid expiry {}", expires)))?;
        let signature = self.sign(reference.as_str(), expires)?;
        debug!("Signed {} until {}", reference, expires_at.to_rfc3339());
        Ok(SignedUrl {
            url: format!(
                "{}/{}?expires={}&signature={}",
                self.base_url, reference, expires, signature
            ),
            expires_at,
        })
    }
}
