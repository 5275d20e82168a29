use serde::Serialize;
use sha2::{Digest, Sha256};

/// The finalized recording. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingArtifact {
    #[serde(skip)]
    bytes: Vec<u8>,
    mime_type: String,
    duration_seconds: u64,
    digest: String,
}

impl RecordingArtifact {
    /// Concatenates fragments in the order given.
    pub fn from_fragments<I>(fragments: I, mime_type: impl Into<String>, duration_seconds: u64) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut bytes = Vec::new();
        for fragment in fragments {
            bytes.extend_from_slice(&fragment);
        }
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Self {
            bytes,
            mime_type: mime_type.into(),
            duration_seconds,
            digest,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Elapsed timer value at finalization, not container metadata.
    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Hex SHA-256 of the payload.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}
