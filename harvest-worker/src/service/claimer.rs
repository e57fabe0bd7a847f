//! Job claimer
//!
//! Claims the next eligible job with a transaction-scoped advisory lock so
//! concurrent workers never run the same job twice.

use chrono::Utc;
use harvest_core::domain::job::{Job, JobStatus};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::repository::{JobStore, StoreError};
use crate::retry::RetryPolicy;

/// Result of one claim attempt
#[derive(Debug)]
enum ClaimAttempt {
    Claimed(Job),
    NoneEligible,
    Conflict(WorkerError),
}

/// Derives the advisory lock key for a job, in `[0, 2^31 - 1)`
pub fn lock_key(job_id: Uuid) -> i64 {
    let (high, low) = job_id.as_u64_pair();
    ((high ^ low) % i32::MAX as u64) as i64
}

pub struct JobClaimer {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl JobClaimer {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Claims the next eligible job
    ///
    /// Conflicts and exhausted retries both answer `None`; the next poll
    /// tries again.
    pub async fn claim(&self) -> Option<Job> {
        let attempt = self
            .retry
            .run(self.store.as_ref(), "Claim next job", || self.try_claim())
            .await;

        match attempt {
            Ok(ClaimAttempt::Claimed(job)) => {
                info!(
                    "Successfully claimed job {} for scraper {}",
                    job.id, job.scraper_id
                );
                Some(job)
            }
            Ok(ClaimAttempt::NoneEligible) => {
                debug!("No eligible jobs found");
                None
            }
            Ok(ClaimAttempt::Conflict(conflict)) => {
                info!("{}", conflict);
                None
            }
            Err(e) => {
                error!("Giving up on claiming a job: {}", e);
                None
            }
        }
    }

    async fn try_claim(&self) -> Result<ClaimAttempt, StoreError> {
        let mut tx = self.store.begin_claim().await?;

        let Some(job) = tx.find_next_eligible_job().await? else {
            tx.rollback().await?;
            return Ok(ClaimAttempt::NoneEligible);
        };

        let waiting = (Utc::now() - job.created_at).num_milliseconds() as f64 / 1000.0;
        info!(
            "Found {} job {} for scraper {} (waiting for {:.1} seconds)",
            job.status, job.id, job.scraper_id, waiting
        );

        if !tx.try_lock(lock_key(job.id)).await? {
            tx.rollback().await?;
            return Ok(conflict(job.id, "advisory lock held by another worker"));
        }

        match tx.read_status_for_update(job.id).await? {
            Some(status) if status.is_claimable() => {}
            Some(status) => {
                tx.rollback().await?;
                return Ok(conflict(job.id, format!("status changed to '{}'", status)));
            }
            None => {
                tx.rollback().await?;
                return Ok(conflict(job.id, "job disappeared"));
            }
        }

        if !tx.claim(job.id).await? {
            tx.rollback().await?;
            return Ok(conflict(job.id, "job was claimed concurrently"));
        }

        tx.commit().await?;

        let now = Utc::now();
        Ok(ClaimAttempt::Claimed(Job {
            status: JobStatus::Running,
            started_at: Some(now),
            claimed_by_worker_at: Some(now),
            error_message: None,
            ..job
        }))
    }
}

fn conflict(job_id: Uuid, reason: impl Into<String>) -> ClaimAttempt {
    ClaimAttempt::Conflict(WorkerError::ClaimConflict {
        job_id,
        reason: reason.into(),
    })
}
