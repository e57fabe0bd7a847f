//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A scraper run claimed from the jobs table
///
/// Created externally; the worker only claims, updates and retires it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    /// The scraper configuration this run executes
    pub scraper_id: Uuid,

    /// Owner of the scraper; keys the auxiliary filter tables
    pub user_id: Uuid,

    /// Competitor the scraped results are attributed to
    pub competitor_id: Option<Uuid>,

    /// Test runs are capped to a small number of results
    pub is_test_run: bool,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub claimed_by_worker_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    pub product_count: i64,
    pub current_batch: Option<i32>,
    pub total_batches: Option<i32>,
    pub execution_time_ms: Option<i64>,
    pub products_per_second: Option<f64>,
}

impl Job {
    /// Creates a freshly queued job
    pub fn pending(scraper_id: Uuid, user_id: Uuid, is_test_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            scraper_id,
            user_id,
            competitor_id: None,
            is_test_run,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            claimed_by_worker_at: None,
            completed_at: None,
            error_message: None,
            product_count: 0,
            current_batch: None,
            total_batches: None,
            execution_time_ms: None,
            products_per_second: None,
        }
    }
}

/// Job lifecycle status
///
/// Transitions are monotonic: `pending|initializing → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Statuses a worker may claim from
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Initializing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Initializing => "initializing",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not part of the lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "initializing" => Ok(JobStatus::Initializing),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
