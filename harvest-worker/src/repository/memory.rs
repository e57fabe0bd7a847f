//! In-memory job store for tests
//!
//! Mirrors the PostgreSQL semantics that matter to the services: advisory
//! locks held until the claim transaction ends, the `status = 'running'`
//! update guard and per-chunk insert atomicity. Faults are injected through
//! [`Faults`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::domain::context::{ActiveBrand, OwnProduct};
use harvest_core::domain::job::{Job, JobStatus};
use harvest_core::dto::job::{JobConfig, JobUpdate};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::store::{ClaimTransaction, JobStore, ScrapedProduct, StoreError};

/// Injected failures
#[derive(Debug, Default)]
pub struct Faults {
    /// Every operation fails, including `ensure_connection`
    pub unavailable: bool,
    /// Number of upcoming `begin_claim` calls that fail
    pub failing_claims: u32,
    /// Chunks containing a product with this name always fail
    pub poisoned_product: Option<String>,
    /// Number of upcoming `update_job` calls that fail
    pub failing_updates: u32,
    pub brands_unavailable: bool,
    pub products_unavailable: bool,
}

#[derive(Debug, Default)]
pub struct State {
    pub jobs: Vec<Job>,
    pub configs: HashMap<Uuid, JobConfig>,
    pub brands: HashMap<Uuid, Vec<ActiveBrand>>,
    pub products: HashMap<Uuid, Vec<OwnProduct>>,
    pub inserted: Vec<ScrapedProduct>,
    pub progress_messages: HashMap<Uuid, Vec<String>>,
    pub updates: Vec<(Uuid, JobUpdate)>,
    pub locks: HashSet<i64>,
    pub ensure_calls: u32,
    pub insert_calls: u32,
    pub faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a job and the scraper configuration it runs against
    pub fn add_job(&self, job: Job, config: JobConfig) {
        let mut state = self.state();
        state.configs.insert(job.scraper_id, config);
        state.jobs.push(job);
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.state().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.state().faults.unavailable {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ensure_connection(&self) -> Result<(), StoreError> {
        self.state().ensure_calls += 1;
        self.check_available()
    }

    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        self.check_available()?;
        {
            let mut state = self.state();
            if state.faults.failing_claims > 0 {
                state.faults.failing_claims -= 1;
                return Err(StoreError::Unavailable("injected claim failure".to_string()));
            }
        }

        Ok(Box::new(MemoryClaimTransaction {
            state: Arc::clone(&self.state),
            held: Vec::new(),
        }))
    }

    async fn fetch_job_config(&self, scraper_id: Uuid) -> Result<Option<JobConfig>, StoreError> {
        self.check_available()?;
        Ok(self.state().configs.get(&scraper_id).cloned())
    }

    async fn fetch_active_brands(&self, user_id: Uuid) -> Result<Vec<ActiveBrand>, StoreError> {
        self.check_available()?;
        let state = self.state();
        if state.faults.brands_unavailable {
            return Err(StoreError::Unavailable("injected brands failure".to_string()));
        }
        Ok(state.brands.get(&user_id).cloned().unwrap_or_default())
    }

    async fn fetch_own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>, StoreError> {
        self.check_available()?;
        let state = self.state();
        if state.faults.products_unavailable {
            return Err(StoreError::Unavailable("injected products failure".to_string()));
        }
        Ok(state.products.get(&user_id).cloned().unwrap_or_default())
    }

    async fn bulk_insert(&self, rows: &[ScrapedProduct]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state();
        state.insert_calls += 1;

        if let Some(poison) = &state.faults.poisoned_product {
            if rows.iter().any(|r| &r.name == poison) {
                return Err(StoreError::Unavailable("injected insert failure".to_string()));
            }
        }

        state.inserted.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state();
        if state.faults.failing_updates > 0 {
            state.faults.failing_updates -= 1;
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }

        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
        else {
            return Ok(false);
        };

        job.status = update.status;
        if let Some(message) = &update.error_message {
            job.error_message = Some(message.clone());
        }
        if let Some(count) = update.product_count {
            job.product_count = count;
        }
        if update.execution_time_ms.is_some() {
            job.execution_time_ms = update.execution_time_ms;
        }
        if update.products_per_second.is_some() {
            job.products_per_second = update.products_per_second;
        }
        if update.current_batch.is_some() {
            job.current_batch = update.current_batch;
        }
        if update.total_batches.is_some() {
            job.total_batches = update.total_batches;
        }
        if update.status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }

        if let Some(details) = &update.error_details {
            state
                .progress_messages
                .entry(job_id)
                .or_default()
                .push(details.clone());
        }
        state.updates.push((job_id, update.clone()));

        Ok(true)
    }

    async fn count_eligible_jobs(&self) -> Result<i64, StoreError> {
        self.check_available()?;
        Ok(self
            .state()
            .jobs
            .iter()
            .filter(|j| j.status.is_claimable())
            .count() as i64)
    }

    async fn fail_orphaned_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut failed = 0;
        for job in self.state().jobs.iter_mut() {
            let orphaned = job.status == JobStatus::Running
                && job.claimed_by_worker_at.is_some_and(|at| at < claimed_before);
            if orphaned {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.completed_at = Some(Utc::now());
                failed += 1;
            }
        }
        Ok(failed)
    }
}

struct MemoryClaimTransaction {
    state: Arc<Mutex<State>>,
    held: Vec<i64>,
}

impl MemoryClaimTransaction {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryClaimTransaction {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.held);
        let mut state = self.state();
        for key in held {
            state.locks.remove(&key);
        }
    }
}

#[async_trait]
impl ClaimTransaction for MemoryClaimTransaction {
    async fn find_next_eligible_job(&mut self) -> Result<Option<Job>, StoreError> {
        let state = self.state();
        let next = state
            .jobs
            .iter()
            .filter(|j| j.status.is_claimable())
            .min_by_key(|j| (j.status != JobStatus::Initializing, j.created_at))
            .cloned();
        Ok(next)
    }

    async fn try_lock(&mut self, key: i64) -> Result<bool, StoreError> {
        let acquired = self.state().locks.insert(key);
        if acquired {
            self.held.push(key);
        }
        Ok(acquired)
    }

    async fn read_status_for_update(
        &mut self,
        job_id: Uuid,
    ) -> Result<Option<JobStatus>, StoreError> {
        Ok(self
            .state()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.status))
    }

    async fn claim(&mut self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status.is_claimable())
        else {
            return Ok(false);
        };

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.claimed_by_worker_at = Some(now);
        job.error_message = None;
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
