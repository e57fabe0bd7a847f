//! Result persistence
//!
//! Records are validated, normalized and written in fixed-width chunks.
//! Each chunk commits on its own; a chunk that keeps failing is skipped so
//! the rest of the run still lands.

use chrono::Utc;
use harvest_core::domain::job::Job;
use harvest_core::domain::record::ResultRecord;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::repository::{JobStore, MAX_INSERT_BATCH, ScrapedProduct};
use crate::retry::RetryPolicy;

pub struct ResultPersister {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    batch_size: usize,
    default_currency: String,
}

impl ResultPersister {
    pub fn new(
        store: Arc<dyn JobStore>,
        retry: RetryPolicy,
        batch_size: usize,
        default_currency: String,
    ) -> Self {
        Self {
            store,
            retry,
            batch_size: batch_size.clamp(1, MAX_INSERT_BATCH),
            default_currency: default_currency.to_uppercase(),
        }
    }

    /// Saves a job's records and returns how many rows were committed
    pub async fn save(&self, job: &Job, records: Vec<ResultRecord>) -> usize {
        let received = records.len();
        let scraped_at = Utc::now();
        let rows: Vec<ScrapedProduct> = records
            .into_iter()
            .filter_map(|record| self.prepare(job, record, scraped_at))
            .collect();

        if rows.is_empty() {
            warn!("No valid records to save ({} received)", received);
            return 0;
        }

        let total = rows.len();
        let chunk_count = total.div_ceil(self.batch_size);
        let mut inserted = 0;

        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let number = index + 1;
            let label = format!("Insert chunk {}/{}", number, chunk_count);

            match self
                .retry
                .run(self.store.as_ref(), &label, || self.store.bulk_insert(chunk))
                .await
            {
                Ok(count) => {
                    inserted += count as usize;
                    debug!(
                        "Inserted chunk {}/{}, {} rows so far",
                        number, chunk_count, inserted
                    );
                }
                Err(source) => {
                    let failure = WorkerError::PersistenceChunkFailure {
                        chunk: number,
                        rows: chunk.len(),
                        attempts: self.retry.max_attempts,
                        source,
                    };
                    error!("{}", failure);
                }
            }
        }

        info!("Saved {}/{} records", inserted, total);
        inserted
    }

    fn prepare(
        &self,
        job: &Job,
        record: ResultRecord,
        scraped_at: chrono::DateTime<Utc>,
    ) -> Option<ScrapedProduct> {
        if !record.is_valid() {
            warn!(
                "Skipping invalid record '{}' with price {}",
                record.name, record.price
            );
            return None;
        }

        let currency_code = record
            .currency
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_currency.clone());

        Some(ScrapedProduct {
            user_id: job.user_id,
            competitor_id: job.competitor_id,
            name: record.name,
            price: record.price,
            currency_code,
            url: record.url,
            image_url: record.image_url,
            sku: record.sku,
            brand: record.brand,
            ean: record.ean,
            raw_data: record.raw_data,
            scraped_at,
        })
    }
}
