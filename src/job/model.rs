use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// The job's position in the state machine. See the state machine table for
/// valid transitions; every write path in `JobStore` enforces one edge of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A single unit of work: one row in the store, one pass through the state
/// machine. `job_type` is deliberately free text rather than a closed enum —
/// new stages must be addable without a migration.
#[derive(Debug, Clone, FromRow, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    #[builder(default = JobStatus::Pending, setter(!into))]
    pub status: JobStatus,
    #[builder(default = 0, setter(!into))]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub repository_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub generation_run_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<Uuid>,
    #[builder(setter(!into))]
    pub payload: Vec<u8>,
    #[builder(default, setter(strip_option, !into))]
    pub result: Option<Vec<u8>>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option, !into))]
    pub error_details: Option<Vec<u8>>,
    #[builder(default = 0, setter(!into))]
    pub retry_count: i32,
    #[builder(default = 3, setter(!into))]
    pub max_retries: i32,
    #[builder(default = Utc::now(), setter(!into))]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now(), setter(!into))]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option, !into))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, !into))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, !into))]
    pub locked_until: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
}

impl Job {
    /// Build a new root job ready to be persisted via `JobStore::create`.
    pub fn new(job_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Job::builder()
            .id(Uuid::new_v4())
            .job_type(job_type)
            .payload(payload)
            .build()
    }

    /// Build a child job inheriting ancestry from `parent` per the chaining
    /// rule: `repository_id`/`generation_run_id` carry forward when the
    /// child doesn't set its own.
    pub fn child_of(parent: &Job, job_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut builder = Job::builder()
            .id(Uuid::new_v4())
            .job_type(job_type)
            .payload(payload)
            .parent_job_id(parent.id);
        if let Some(repo) = parent.repository_id {
            builder = builder.repository_id(repo);
        }
        if let Some(run) = parent.generation_run_id {
            builder = builder.generation_run_id(run);
        }
        builder.build()
    }

    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Pending
    }
}
