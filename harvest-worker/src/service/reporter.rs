//! Status reporting
//!
//! Terminal and intermediate job updates. Reporting never raises: if the
//! store stays unreachable the failure is logged and the job may remain
//! `running`.

use harvest_core::domain::job::{Job, JobStatus};
use harvest_core::domain::record::BatchProgress;
use harvest_core::dto::job::JobUpdate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::repository::JobStore;
use crate::retry::RetryPolicy;

pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;
pub const MAX_ERROR_DETAILS_CHARS: usize = 4000;

/// Why a job failed
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    MissingScript {
        scraper_id: Uuid,
    },
    Timeout {
        seconds: u64,
        stderr_tail: Vec<String>,
    },
    ExitCode {
        code: i32,
        stderr_tail: Vec<String>,
    },
    /// Exit code 0, but stderr reported errors
    ReportedErrors {
        lines: Vec<String>,
    },
    Worker(String),
}

impl JobFailure {
    /// The job's `error_message`
    pub fn message(&self) -> String {
        match self {
            JobFailure::MissingScript { scraper_id } => {
                format!("Failed to fetch script for scraper {}", scraper_id)
            }
            JobFailure::Timeout { seconds, .. } => {
                format!("Script execution timed out after {} seconds.", seconds)
            }
            JobFailure::ExitCode { code, .. } => {
                format!("Script failed with exit code {}.", code)
            }
            JobFailure::ReportedErrors { .. } => {
                "Script exited with code 0 but reported errors on stderr.".to_string()
            }
            JobFailure::Worker(cause) => format!("Worker error: {}", cause),
        }
    }

    /// Diagnostic detail appended to the job's message log
    pub fn details(&self) -> Option<String> {
        match self {
            JobFailure::Timeout {
                seconds,
                stderr_tail,
            } => Some(with_tail(format!("Timeout: {}s", seconds), stderr_tail)),
            JobFailure::ExitCode { code, stderr_tail } => {
                Some(with_tail(format!("Exit Code: {}", code), stderr_tail))
            }
            JobFailure::ReportedErrors { lines } => Some(lines.join("\n")),
            JobFailure::MissingScript { .. } | JobFailure::Worker(_) => None,
        }
    }
}

fn with_tail(header: String, tail: &[String]) -> String {
    if tail.is_empty() {
        header
    } else {
        format!("{}\nLast stderr lines:\n{}", header, tail.join("\n"))
    }
}

/// How a processed job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { product_count: usize },
    Failed {
        failure: JobFailure,
        product_count: usize,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn product_count(&self) -> usize {
        match self {
            JobOutcome::Completed { product_count } | JobOutcome::Failed { product_count, .. } => {
                *product_count
            }
        }
    }
}

/// Truncates to at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// Products per second, 0 when no time has elapsed
pub fn throughput(product_count: usize, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        product_count as f64 / seconds
    } else {
        0.0
    }
}

/// Builds the single update that retires a job
pub fn terminal_update(
    outcome: &JobOutcome,
    elapsed: Duration,
    progress: Option<BatchProgress>,
) -> JobUpdate {
    let product_count = outcome.product_count();
    let (error_message, error_details) = match outcome {
        JobOutcome::Completed { .. } => (None, None),
        JobOutcome::Failed { failure, .. } => (
            Some(truncate_chars(&failure.message(), MAX_ERROR_MESSAGE_CHARS)),
            failure
                .details()
                .map(|d| truncate_chars(&d, MAX_ERROR_DETAILS_CHARS)),
        ),
    };

    let batches = progress.map(JobUpdate::progress);

    JobUpdate {
        status: outcome.status(),
        error_message,
        error_details,
        product_count: Some(product_count as i64),
        execution_time_ms: Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)),
        products_per_second: Some(throughput(product_count, elapsed)),
        current_batch: batches.as_ref().and_then(|b| b.current_batch),
        total_batches: batches.as_ref().and_then(|b| b.total_batches),
    }
}

pub struct StatusReporter {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Retires a job with one terminal update
    ///
    /// # Returns
    /// Whether the job row was updated
    pub async fn finalize(
        &self,
        job: &Job,
        outcome: &JobOutcome,
        elapsed: Duration,
        progress: Option<BatchProgress>,
    ) -> bool {
        let update = terminal_update(outcome, elapsed, progress);
        self.apply(job.id, update).await
    }

    /// Fails a job after a worker-level error
    pub async fn fail_unexpected(&self, job_id: Uuid, cause: &str, elapsed: Duration) -> bool {
        let outcome = JobOutcome::Failed {
            failure: JobFailure::Worker(cause.to_string()),
            product_count: 0,
        };
        self.apply(job_id, terminal_update(&outcome, elapsed, None))
            .await
    }

    /// Records batch progress on a running job
    pub async fn report_progress(&self, job: &Job, progress: BatchProgress) {
        let update = JobUpdate::progress(progress);
        match self.store.update_job(job.id, &update).await {
            Ok(true) => info!(
                "Updated progress: batch {}/{}",
                progress.current, progress.total
            ),
            Ok(false) => warn!("Job {} is no longer running, progress not recorded", job.id),
            Err(e) => warn!("Failed to update progress in database: {}", e),
        }
    }

    async fn apply(&self, job_id: Uuid, update: JobUpdate) -> bool {
        let label = format!("Update job {} to {}", job_id, update.status);
        let result = self
            .retry
            .run(self.store.as_ref(), &label, || {
                self.store.update_job(job_id, &update)
            })
            .await;

        match result {
            Ok(true) => {
                info!("Updated job status to {}", update.status);
                true
            }
            Ok(false) => {
                warn!(
                    "Job {} was no longer running, status {} not written",
                    job_id, update.status
                );
                false
            }
            Err(source) => {
                error!("{}", WorkerError::ReportingFailure { job_id, source });
                false
            }
        }
    }
}
