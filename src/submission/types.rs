use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::upload::StorageReference;

/// Campaign details the recorder reads; owned by the campaign service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub description: String,
    pub target_url: String,
    pub points_reward: u32,
    pub max_submissions_per_user: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

/// What the coordinator sends to the registry after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSubmission {
    pub user_id: String,
    pub campaign_id: String,
    pub storage_reference: StorageReference,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub campaign_id: String,
    pub storage_reference: StorageReference,
    pub duration_seconds: u64,
    pub status: SubmissionStatus,
    pub points_awarded: u32,
    pub created_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn pending(submission: NewSubmission) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: submission.user_id,
            campaign_id: submission.campaign_id,
            storage_reference: submission.storage_reference,
            duration_seconds: submission.duration_seconds,
            status: SubmissionStatus::Pending,
            points_awarded: 0,
            created_at: Utc::now(),
        }
    }
}

/// Whether a user may record another attempt for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub existing: u32,
    pub max: u32,
    pub active: bool,
}

impl Eligibility {
    pub fn allowed(&self) -> bool {
        self.active && self.existing < self.max
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligibility(existing: u32, max: u32) -> Eligibility {
        Eligibility {
            existing,
            max,
            active: true,
        }
    }

    #[test]
    fn limit_is_strictly_less_than_max() {
        assert!(!eligibility(1, 1).allowed());
        assert!(eligibility(2, 3).allowed());
        assert!(!eligibility(3, 3).allowed());
        assert!(eligibility(0, 1).allowed());
        assert_eq!(eligibility(5, 3).remaining(), 0);
    }

    #[test]
    fn inactive_campaign_is_never_allowed() {
        let e = Eligibility {
            existing: 0,
            max: 3,
            active: false,
        };
        assert!(!e.allowed());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
