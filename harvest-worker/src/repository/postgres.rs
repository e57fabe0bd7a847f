//! PostgreSQL job store
//!
//! Works against the shared scraper schema: `scraper_runs` (jobs),
//! `scrapers` (job configuration), `brands` and `products` (filter lists)
//! and `temp_competitors_scraped_data` (results).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::domain::context::{ActiveBrand, OwnProduct};
use harvest_core::domain::job::{Job, JobStatus};
use harvest_core::dto::job::{JobConfig, JobUpdate};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{ClaimTransaction, JobStore, ScrapedProduct, StoreError};
use crate::db::ConnectionGuard;

/// Eligibility shared by the claim query and the backlog count
const ELIGIBLE_JOBS: &str = r#"
    FROM scraper_runs sr
    INNER JOIN scrapers s ON sr.scraper_id = s.id
    WHERE sr.status IN ('pending', 'initializing')
      AND (s.scraper_type = 'python' OR s.scraper_type IS NULL)
"#;

/// PostgreSQL implementation of [`JobStore`]
pub struct PgJobStore {
    guard: ConnectionGuard,
    pool: Mutex<Option<PgPool>>,
}

impl PgJobStore {
    /// Creates a store around an already opened pool
    pub fn new(guard: ConnectionGuard, pool: PgPool) -> Self {
        Self {
            guard,
            pool: Mutex::new(Some(pool)),
        }
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no open connection".to_string()))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ensure_connection(&self) -> Result<(), StoreError> {
        let mut slot = self.pool.lock().await;
        let pool = self.guard.ensure(slot.take()).await?;
        *slot = Some(pool);
        Ok(())
    }

    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        let tx = self.pool().await?.begin().await?;
        Ok(Box::new(PgClaimTransaction { tx }))
    }

    async fn fetch_job_config(&self, scraper_id: Uuid) -> Result<Option<JobConfig>, StoreError> {
        let row = sqlx::query_as::<_, JobConfigRow>(
            r#"
            SELECT python_script,
                   COALESCE(filter_by_active_brands, FALSE) AS filter_by_active_brands,
                   COALESCE(scrape_only_own_products, FALSE) AS scrape_only_own_products
            FROM scrapers
            WHERE id = $1
            "#,
        )
        .bind(scraper_id)
        .fetch_optional(&self.pool().await?)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn fetch_active_brands(&self, user_id: Uuid) -> Result<Vec<ActiveBrand>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Option<String>)>(
            "SELECT id, name FROM brands WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_all(&self.pool().await?)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name)| name.map(|name| ActiveBrand { id, name }))
            .collect())
    }

    async fn fetch_own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>, StoreError> {
        let rows = sqlx::query_as::<_, OwnProductRow>(
            "SELECT ean, sku, brand, brand_id FROM products WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_all(&self.pool().await?)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn bulk_insert(&self, rows: &[ScrapedProduct]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO temp_competitors_scraped_data (\
             user_id, competitor_id, name, competitor_price, currency_code, \
             url, image_url, sku, brand, ean, raw_data, scraped_at) ",
        );

        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.user_id)
                .push_bind(row.competitor_id)
                .push_bind(row.name.clone())
                .push_bind(row.price)
                .push_bind(row.currency_code.clone())
                .push_bind(row.url.clone())
                .push_bind(row.image_url.clone())
                .push_bind(row.sku.clone())
                .push_bind(row.brand.clone())
                .push_bind(row.ean.clone())
                .push_bind(row.raw_data.clone())
                .push_bind(row.scraped_at);
        });

        let result = builder.build().execute(&self.pool().await?).await?;
        Ok(result.rows_affected())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<bool, StoreError> {
        let details = update
            .error_details
            .as_ref()
            .map(|details| error_details_entry(details, Utc::now()));

        let result = sqlx::query(
            r#"
            UPDATE scraper_runs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                product_count = COALESCE($4, product_count),
                execution_time_ms = COALESCE($5, execution_time_ms),
                products_per_second = COALESCE($6, products_per_second),
                current_batch = COALESCE($7, current_batch),
                total_batches = COALESCE($8, total_batches),
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                progress_messages = CASE
                    WHEN $9::TEXT IS NULL THEN progress_messages
                    ELSE array_append(COALESCE(progress_messages, ARRAY[]::TEXT[]), $9::TEXT)
                END
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(update.status.as_str())
        .bind(update.error_message.as_deref())
        .bind(update.product_count)
        .bind(update.execution_time_ms)
        .bind(update.products_per_second)
        .bind(update.current_batch)
        .bind(update.total_batches)
        .bind(details)
        .execute(&self.pool().await?)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_eligible_jobs(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) {}", ELIGIBLE_JOBS);
        let (count,) = sqlx::query_as::<_, (i64,)>(&sql)
            .fetch_one(&self.pool().await?)
            .await?;
        Ok(count)
    }

    async fn fail_orphaned_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scraper_runs
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE status = 'running' AND claimed_by_worker_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(message)
        .execute(&self.pool().await?)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Claim transaction backed by a PostgreSQL transaction
struct PgClaimTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ClaimTransaction for PgClaimTransaction {
    async fn find_next_eligible_job(&mut self) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT sr.id, sr.scraper_id, sr.user_id, s.competitor_id,
                   COALESCE(sr.is_test_run, FALSE) AS is_test_run,
                   sr.status, sr.created_at, sr.started_at,
                   sr.claimed_by_worker_at, sr.completed_at, sr.error_message,
                   COALESCE(sr.product_count, 0)::BIGINT AS product_count,
                   sr.current_batch::INT AS current_batch,
                   sr.total_batches::INT AS total_batches,
                   sr.execution_time_ms::BIGINT AS execution_time_ms,
                   sr.products_per_second::FLOAT8 AS products_per_second
            {}
            ORDER BY CASE WHEN sr.status = 'initializing' THEN 0 ELSE 1 END,
                     sr.created_at ASC
            LIMIT 1
            "#,
            ELIGIBLE_JOBS
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn try_lock(&mut self, key: i64) -> Result<bool, StoreError> {
        let (acquired,) = sqlx::query_as::<_, (bool,)>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(key)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(acquired)
    }

    async fn read_status_for_update(
        &mut self,
        job_id: Uuid,
    ) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT status FROM scraper_runs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|(status,)| status.parse::<JobStatus>().map_err(|e| StoreError::Decode(format!("{}", e))))
            .transpose()
    }

    async fn claim(&mut self, job_id: Uuid) -> Result<bool, StoreError> {
        let claimed = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE scraper_runs
            SET status = 'running',
                started_at = NOW(),
                claimed_by_worker_at = NOW(),
                error_message = NULL
            WHERE id = $1 AND status IN ('pending', 'initializing')
            RETURNING id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(claimed.is_some())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Entry appended to `progress_messages` for a failure's details
fn error_details_entry(details: &str, at: DateTime<Utc>) -> String {
    serde_json::json!({
        "ts": at.to_rfc3339(),
        "type": "error_details",
        "details": details,
    })
    .to_string()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    scraper_id: Uuid,
    user_id: Uuid,
    competitor_id: Option<Uuid>,
    is_test_run: bool,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    claimed_by_worker_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    product_count: i64,
    current_batch: Option<i32>,
    total_batches: Option<i32>,
    execution_time_ms: Option<i64>,
    products_per_second: Option<f64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Decode(format!("job {}: {}", row.id, e)))?;

        Ok(Job {
            id: row.id,
            scraper_id: row.scraper_id,
            user_id: row.user_id,
            competitor_id: row.competitor_id,
            is_test_run: row.is_test_run,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            claimed_by_worker_at: row.claimed_by_worker_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            product_count: row.product_count,
            current_batch: row.current_batch,
            total_batches: row.total_batches,
            execution_time_ms: row.execution_time_ms,
            products_per_second: row.products_per_second,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobConfigRow {
    python_script: Option<String>,
    filter_by_active_brands: bool,
    scrape_only_own_products: bool,
}

impl From<JobConfigRow> for JobConfig {
    fn from(row: JobConfigRow) -> Self {
        JobConfig {
            script: row.python_script,
            filter_by_active_brands: row.filter_by_active_brands,
            scrape_only_own_products: row.scrape_only_own_products,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OwnProductRow {
    ean: Option<String>,
    sku: Option<String>,
    brand: Option<String>,
    brand_id: Option<Uuid>,
}

impl From<OwnProductRow> for OwnProduct {
    fn from(row: OwnProductRow) -> Self {
        OwnProduct {
            ean: row.ean,
            sku: row.sku,
            brand: row.brand,
            brand_id: row.brand_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_error_details_entry_shape() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let entry: serde_json::Value =
            serde_json::from_str(&error_details_entry("Exit Code: 2", at)).unwrap();

        assert_eq!(entry["type"], "error_details");
        assert_eq!(entry["details"], "Exit Code: 2");
        assert_eq!(entry["ts"], "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_job_row_rejects_unknown_status() {
        let row = JobRow {
            id: Uuid::new_v4(),
            scraper_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            competitor_id: None,
            is_test_run: false,
            status: "queued".to_string(),
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
        };

        assert!(matches!(Job::try_from(row), Err(StoreError::Decode(_))));
    }
}
