//! Execution context assembly
//!
//! Filter lists come from auxiliary tables keyed by the job owner. A failed
//! fetch disables that filter for the run instead of blocking the job.

use harvest_core::domain::context::{BrandFilter, ExecutionContext, OwnProductFilter};
use harvest_core::domain::job::Job;
use harvest_core::dto::job::JobConfig;
use std::sync::Arc;
use tracing::{info, warn};

use crate::repository::JobStore;

pub struct ContextBuilder {
    store: Arc<dyn JobStore>,
    test_run_limit: usize,
}

impl ContextBuilder {
    /// Creates a new context builder
    ///
    /// # Arguments
    /// * `store` - Source of the filter lists
    /// * `test_run_limit` - Result cap handed to test runs
    pub fn new(store: Arc<dyn JobStore>, test_run_limit: usize) -> Self {
        Self {
            store,
            test_run_limit,
        }
    }

    /// Builds the immutable context for one job
    pub async fn build(&self, job: &Job, config: &JobConfig) -> ExecutionContext {
        let brands = if config.filter_by_active_brands {
            self.brand_filter(job).await
        } else {
            BrandFilter::default()
        };

        let own_products = if config.scrape_only_own_products {
            self.own_product_filter(job).await
        } else {
            OwnProductFilter::default()
        };

        let limit_products = job.is_test_run.then_some(self.test_run_limit);
        if let Some(limit) = limit_products {
            info!("Test run: limiting results to {} products", limit);
        }

        ExecutionContext {
            run_id: job.id,
            scraper_id: job.scraper_id,
            user_id: job.user_id,
            competitor_id: job.competitor_id,
            is_test_run: job.is_test_run,
            limit_products,
            brands,
            own_products,
        }
    }

    async fn brand_filter(&self, job: &Job) -> BrandFilter {
        match self.store.fetch_active_brands(job.user_id).await {
            Ok(brands) => {
                info!("Filtering by {} active brands", brands.len());
                BrandFilter::from_brands(brands)
            }
            Err(e) => {
                warn!("Failed to fetch active brands, brand filter disabled: {}", e);
                BrandFilter::default()
            }
        }
    }

    async fn own_product_filter(&self, job: &Job) -> OwnProductFilter {
        match self.store.fetch_own_products(job.user_id).await {
            Ok(products) => {
                let filter = OwnProductFilter::from_products(products);
                info!(
                    "Filtering by {} own EANs and {} SKU/brand pairs",
                    filter.eans.len(),
                    filter.sku_brands.len()
                );
                filter
            }
            Err(e) => {
                warn!(
                    "Failed to fetch own products, own-product filter disabled: {}",
                    e
                );
                OwnProductFilter::default()
            }
        }
    }
}
