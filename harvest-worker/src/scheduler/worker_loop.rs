//! Worker loop
//!
//! Claims and processes one job at a time. Between cycles it sleeps for the
//! poll interval when the queue was empty, or for the failure backoff when
//! the cycle failed. A shutdown signal is only honoured between cycles, so
//! a job in flight always reaches its terminal status first.

use harvest_core::domain::job::Job;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::backoff::Backoff;
use super::health::HealthMonitor;
use crate::config::Config;
use crate::error::WorkerError;
use crate::repository::JobStore;
use crate::service::{JobClaimer, JobExecutor, JobOutcome, StatusReporter};

/// What the worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Persisting,
    Reporting,
}

pub struct WorkerLoop {
    poll_interval: Duration,
    store: Arc<dyn JobStore>,
    claimer: JobClaimer,
    executor: Arc<JobExecutor>,
    reporter: Arc<StatusReporter>,
    health: HealthMonitor,
    backoff: Backoff,
    state: Arc<watch::Sender<WorkerState>>,
}

impl WorkerLoop {
    /// Wires the worker from configuration
    ///
    /// # Arguments
    /// * `config` - Worker configuration
    /// * `store` - Job store shared by every stage
    /// * `state` - Published worker state
    pub fn new(
        config: &Config,
        store: Arc<dyn JobStore>,
        state: Arc<watch::Sender<WorkerState>>,
    ) -> Self {
        let executor = Arc::new(JobExecutor::new(
            config,
            Arc::clone(&store),
            Arc::clone(&state),
        ));

        Self {
            poll_interval: config.poll_interval,
            claimer: JobClaimer::new(Arc::clone(&store), config.claim_retry()),
            reporter: executor.reporter(),
            executor,
            health: HealthMonitor::new(
                Arc::clone(&store),
                config.health_check_interval,
                config.inactivity_threshold,
                config.orphan_lease,
            ),
            backoff: Backoff::new(config.backoff_base, config.max_backoff),
            store,
            state,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Runs until `shutdown` turns true or its sender is dropped
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting worker loop (poll interval: {:?})",
            self.poll_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.health.maybe_probe().await;

            let result = self.run_cycle().await;
            self.state.send_replace(WorkerState::Idle);
            let delay = self.settle(result);

            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Worker loop stopped");
    }

    /// Claims and processes at most one job
    ///
    /// # Returns
    /// The job's outcome, or `None` when nothing was eligible
    pub async fn run_cycle(&mut self) -> Result<Option<JobOutcome>, WorkerError> {
        self.store
            .ensure_connection()
            .await
            .map_err(WorkerError::StoreUnavailable)?;

        self.state.send_replace(WorkerState::Claiming);
        let Some(job) = self.claimer.claim().await else {
            return Ok(None);
        };
        self.health.record_claim();

        self.state.send_replace(WorkerState::Executing);
        let job_id = job.id;
        let started = Instant::now();
        let handle = self.spawn_job(job);
        self.await_job(job_id, handle, started).await.map(Some)
    }

    fn spawn_job(&self, job: Job) -> JoinHandle<JobOutcome> {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move { executor.execute(job).await })
    }

    /// Waits for a job task, failing the job if the task panicked
    async fn await_job(
        &self,
        job_id: Uuid,
        handle: JoinHandle<JobOutcome>,
        started: Instant,
    ) -> Result<JobOutcome, WorkerError> {
        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let cause = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                let failure = WorkerError::JobPanicked { job_id, cause };
                error!("{}", failure);
                self.reporter
                    .fail_unexpected(job_id, &failure.to_string(), started.elapsed())
                    .await;
                Err(failure)
            }
        }
    }

    /// Updates the backoff and returns how long to sleep before the next cycle
    fn settle(&mut self, result: Result<Option<JobOutcome>, WorkerError>) -> Duration {
        match result {
            Ok(Some(_)) => {
                self.backoff.reset();
                Duration::ZERO
            }
            Ok(None) => {
                self.backoff.reset();
                debug!("No jobs available, sleeping {:?}", self.poll_interval);
                self.poll_interval
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                error!(
                    "Worker cycle failed ({} consecutive): {}; retrying in {:?}",
                    self.backoff.failures(),
                    e,
                    delay
                );
                delay
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
