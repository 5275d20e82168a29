use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::info;

use crate::error::RegistrationError;
use crate::submission::types::{Campaign, NewSubmission, SubmissionRecord};

/// Data collaborator that owns submission records.
#[async_trait]
pub trait SubmissionRegistry: Send + Sync {
    async fn submission_count(&self, user_id: &str, campaign_id: &str) -> Result<u32, RegistrationError>;

    /// Fails with `RegistrationConflict` when the user has used up the
    /// campaign's attempts.
    async fn register(&self, submission: NewSubmission) -> Result<SubmissionRecord, RegistrationError>;
}

/// In-process registry enforcing each campaign's per-user limit.
#[derive(Default)]
pub struct MemoryRegistry {
    limits: Mutex<HashMap<String, u32>>,
    records: Mutex<Vec<SubmissionRecord>>,
    injected: Mutex<VecDeque<RegistrationError>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_campaign(campaign: &Campaign) -> Self {
        let registry = Self::new();
        registry.add_campaign(campaign);
        registry
    }

    pub fn add_campaign(&self, campaign: &Campaign) {
        self.limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(campaign.id.clone(), campaign.max_submissions_per_user);
    }

    /// Inserts an existing record, e.g. an earlier attempt.
    pub fn seed(&self, record: SubmissionRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    /// The next `register` call fails with `err`.
    pub fn fail_next(&self, err: RegistrationError) {
        self.injected.lock().unwrap_or_else(PoisonError::into_inner).push_back(err);
    }

    pub fn records(&self) -> Vec<SubmissionRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn count(&self, user_id: &str, campaign_id: &str) -> u32 {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.user_id == user_id && r.campaign_id == campaign_id)
            .count() as u32
    }
}

#[async_trait]
impl SubmissionRegistry for MemoryRegistry {
    async fn submission_count(&self, user_id: &str, campaign_id: &str) -> Result<u32, RegistrationError> {
        Ok(self.count(user_id, campaign_id))
    }

    async fn register(&self, submission: NewSubmission) -> Result<SubmissionRecord, RegistrationError> {
        if let Some(err) = self.injected.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            return Err(err);
        }
        let limit = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&submission.campaign_id)
            .copied()
            .ok_or_else(|| {
                RegistrationError::RegistrationError(format!("unknown campaign {}", submission.campaign_id))
            })?;

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = records
            .iter()
            .filter(|r| r.user_id == submission.user_id && r.campaign_id == submission.campaign_id)
            .count() as u32;
        if existing >= limit {
            return Err(RegistrationError::RegistrationConflict(format!(
                "user {} already has {} of {} submissions for campaign {}",
                submission.user_id, existing, limit, submission.campaign_id
            )));
        }

        let record = SubmissionRecord::pending(submission);
        info!(
            "Registered submission {} for campaign {} ({})",
            record.id, record.campaign_id, record.storage_reference
        );
        records.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::types::SubmissionStatus;
    use crate::upload::StorageReference;

    fn campaign(max: u32) -> Campaign {
        Campaign {
            id: "c1".into(),
            title: "Checkout flow".into(),
            description: "Buy the cheapest item".into(),
            target_url: "https://shop.example.com".into(),
            points_reward: 50,
            max_submissions_per_user: max,
            is_active: true,
        }
    }

    fn submission(path: &str) -> NewSubmission {
        NewSubmission {
            user_id: "u1".into(),
            campaign_id: "c1".into(),
            storage_reference: StorageReference::new(path),
            duration_seconds: 12,
        }
    }

    #[tokio::test]
    async fn register_creates_pending_record() {
        let registry = MemoryRegistry::with_campaign(&campaign(1));
        let record = registry.register(submission("u1/c1/a.webm")).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Pending);
        assert_eq!(record.duration_seconds, 12);
        assert_eq!(registry.submission_count("u1", "c1").await.unwrap(), 1);
        assert_eq!(registry.submission_count("u2", "c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_beyond_limit_is_a_conflict() {
        let registry = MemoryRegistry::with_campaign(&campaign(1));
        registry.register(submission("u1/c1/a.webm")).await.unwrap();
        let err = registry.register(submission("u1/c1/b.webm")).await.unwrap_err();
        assert!(matches!(err, RegistrationError::RegistrationConflict(_)));
    }

    #[tokio::test]
    async fn unknown_campaign_is_rejected() {
        let registry = MemoryRegistry::new();
        let err = registry.register(submission("u1/c1/a.webm")).await.unwrap_err();
        assert!(matches!(err, RegistrationError::RegistrationError(_)));
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let registry = MemoryRegistry::with_campaign(&campaign(3));
        registry.fail_next(RegistrationError::RegistrationError("network".into()));
        assert!(registry.register(submission("a.webm")).await.is_err());
        assert!(registry.register(submission("a.webm")).await.is_ok());
    }
}
