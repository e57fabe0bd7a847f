//! Job store contract
//!
//! Every operation is retry-safe: repeating a call after a transport error
//! never corrupts state. Claiming happens inside a [`ClaimTransaction`] so
//! the lookup, the advisory lock, the status re-check and the status flip
//! share one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::domain::context::{ActiveBrand, OwnProduct};
use harvest_core::domain::job::{Job, JobStatus};
use harvest_core::dto::job::{JobConfig, JobUpdate};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unexpected row data: {0}")]
    Decode(String),
}

/// One row destined for `temp_competitors_scraped_data`
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedProduct {
    pub user_id: Uuid,
    pub competitor_id: Option<Uuid>,
    pub name: String,
    pub price: f64,
    /// Upper-case ISO code
    pub currency_code: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub ean: Option<String>,
    pub raw_data: Option<serde_json::Value>,
    pub scraped_at: DateTime<Utc>,
}

/// Bind parameters one [`ScrapedProduct`] takes in a bulk insert
pub const BINDS_PER_PRODUCT: usize = 12;

/// Most rows a single bulk insert can carry under PostgreSQL's 65535 bind limit
pub const MAX_INSERT_BATCH: usize = u16::MAX as usize / BINDS_PER_PRODUCT;

/// An open claim transaction
///
/// Dropping it without calling [`commit`](ClaimTransaction::commit) rolls
/// back and releases the advisory lock.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// Finds the oldest eligible job, `initializing` before `pending`
    async fn find_next_eligible_job(&mut self) -> Result<Option<Job>, StoreError>;

    /// Tries to take the transaction-scoped advisory lock for `key`
    async fn try_lock(&mut self, key: i64) -> Result<bool, StoreError>;

    /// Re-reads the job status, locking the row
    async fn read_status_for_update(&mut self, job_id: Uuid)
    -> Result<Option<JobStatus>, StoreError>;

    /// Flips a claimable job to `running`; false when it was no longer claimable
    async fn claim(&mut self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store operations used by the worker
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Verifies the connection and reopens it when stale
    async fn ensure_connection(&self) -> Result<(), StoreError>;

    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError>;

    /// Loads the scraper configuration a job runs against
    ///
    /// # Arguments
    /// * `scraper_id` - The scraper row the job targets
    async fn fetch_job_config(&self, scraper_id: Uuid) -> Result<Option<JobConfig>, StoreError>;

    async fn fetch_active_brands(&self, user_id: Uuid) -> Result<Vec<ActiveBrand>, StoreError>;

    async fn fetch_own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>, StoreError>;

    /// Inserts one chunk atomically, returning the number of rows written
    async fn bulk_insert(&self, rows: &[ScrapedProduct]) -> Result<u64, StoreError>;

    /// Applies an update to a job that is still `running`
    ///
    /// Returns false when no running job matched, so a terminal status is
    /// never overwritten.
    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<bool, StoreError>;

    /// Counts jobs a worker could claim right now
    async fn count_eligible_jobs(&self) -> Result<i64, StoreError>;

    /// Fails `running` jobs claimed before `claimed_before`
    async fn fail_orphaned_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError>;
}
