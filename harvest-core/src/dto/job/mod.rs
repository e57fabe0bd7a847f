//! Job DTOs for store communication

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;
use crate::domain::record::BatchProgress;

/// Scraper configuration a job runs against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Payload source; `None` when the scraper has no script
    pub script: Option<String>,
    pub filter_by_active_brands: bool,
    pub scrape_only_own_products: bool,
}

impl JobConfig {
    /// Returns the script when it is present and non-blank
    pub fn runnable_script(&self) -> Option<&str> {
        self.script.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Fields written by a single job update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    /// Appended to the job's message log rather than overwriting anything
    pub error_details: Option<String>,
    pub product_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub products_per_second: Option<f64>,
    pub current_batch: Option<i32>,
    pub total_batches: Option<i32>,
}

impl JobUpdate {
    /// An update that only sets the status
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            error_details: None,
            product_count: None,
            execution_time_ms: None,
            products_per_second: None,
            current_batch: None,
            total_batches: None,
        }
    }

    /// An intermediate update carrying batch progress for a running job
    pub fn progress(progress: BatchProgress) -> Self {
        Self {
            current_batch: Some(clamp_i32(progress.current)),
            total_batches: Some(clamp_i32(progress.total)),
            ..Self::status(JobStatus::Running)
        }
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
