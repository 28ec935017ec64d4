use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::model::JobStatus;

/// An append-only record of a single status transition. `changed_by` is
/// `"api"`, `"system"` (retry driver, stale-lock cleaner), or a worker id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub previous_status: JobStatus,
    pub new_status: JobStatus,
    pub changed_by: String,
    pub at: DateTime<Utc>,
}

impl JobHistoryEntry {
    pub fn new(
        job_id: Uuid,
        previous_status: JobStatus,
        new_status: JobStatus,
        changed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            previous_status,
            new_status,
            changed_by: changed_by.into(),
            at: Utc::now(),
        }
    }
}
