use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;

use crate::error::StorageError;
use crate::upload::storage::{SignedUrl, StoragePort, StorageReference, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process object store.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        mode: WriteMode,
    ) -> Result<StorageReference, StorageError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if mode == WriteMode::CreateNew && objects.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        objects.insert(
            path.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        debug!("Stored {} bytes at memory://{}", bytes.len(), path);
        Ok(StorageReference::new(path))
    }

    async fn signed_url(
        &self,
        reference: &StorageReference,
        expiry: Duration,
    ) -> Result<SignedUrl, StorageError> {
        if self.get(reference.as_str()).is_none() {
            return Err(StorageError::NotFound(reference.to_string()));
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expiry)
                .map_err(|e| StorageError::Transport(e.to_string()))?;
        Ok(SignedUrl {
            url: format!("memory://{}?expires={}", reference, expires_at.timestamp()),
            expires_at,
        })
    }
}
