//! Worker error taxonomy
//!
//! Job-level failures never surface here; they become the job's `failed`
//! status. These are the infrastructure conditions the worker logs and
//! answers with retries or backoff.

use crate::repository::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// Another worker won the race for this job; treated as "no job"
    #[error("claim conflict on job {job_id}: {reason}")]
    ClaimConflict { job_id: Uuid, reason: String },

    #[error("chunk {chunk} ({rows} rows) not saved after {attempts} attempts: {source}")]
    PersistenceChunkFailure {
        chunk: usize,
        rows: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to report status of job {job_id}: {source}")]
    ReportingFailure {
        job_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("processing of job {job_id} panicked: {cause}")]
    JobPanicked { job_id: Uuid, cause: String },
}
