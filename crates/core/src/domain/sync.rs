use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deal::DealId;
use crate::domain::dispatch::DispatchRequest;
use crate::domain::intent::WriteIntent;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncItemId(pub String);

impl std::fmt::Display for SyncItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemStatus {
    /// Waiting for its first retry.
    Queued,
    /// At least one retry failed; the next one is scheduled.
    Scheduled,
    Completed,
    FailedManualReview,
}

impl SyncItemStatus {
    pub const ALL: [SyncItemStatus; 4] =
        [Self::Queued, Self::Scheduled, Self::Completed, Self::FailedManualReview];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::FailedManualReview => "failed_manual_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "failed_manual_review" => Some(Self::FailedManualReview),
            _ => None,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Scheduled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// The deal already reflects everything the intent would write.
    Superseded,
    TransientFailure,
    PermanentFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: SyncItemId,
    pub deal_id: DealId,
    pub write_intent: WriteIntent,
    /// Receipt dispatch to run once the write lands.
    pub follow_up: Option<DispatchRequest>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_intervals_secs: Vec<u64>,
    pub status: SyncItemStatus,
    pub history: Vec<SyncAttempt>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub state_version: u32,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueFilter {
    pub status: Option<SyncItemStatus>,
    pub deal_id: Option<DealId>,
    pub limit: Option<u32>,
}

impl SyncQueueFilter {
    pub fn matches(&self, item: &SyncQueueItem) -> bool {
        self.status.map_or(true, |status| item.status == status)
            && self.deal_id.as_ref().map_or(true, |deal_id| &item.deal_id == deal_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueStats {
    pub queued: u64,
    pub scheduled: u64,
    pub completed: u64,
    pub failed_manual_review: u64,
}

impl SyncQueueStats {
    pub fn record(&mut self, status: SyncItemStatus, count: u64) {
        match status {
            SyncItemStatus::Queued => self.queued += count,
            SyncItemStatus::Scheduled => self.scheduled += count,
            SyncItemStatus::Completed => self.completed += count,
            SyncItemStatus::FailedManualReview => self.failed_manual_review += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.scheduled + self.completed + self.failed_manual_review
    }
}
