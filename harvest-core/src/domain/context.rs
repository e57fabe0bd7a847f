//! Execution context handed to a scraper payload
//!
//! The context is serialized to JSON and passed to the child process as
//! `--context=<json>`. Field names are part of the payload contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable per-job execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub scraper_id: Uuid,
    pub user_id: Uuid,
    pub competitor_id: Option<Uuid>,
    pub is_test_run: bool,

    /// Maximum number of results a test run may produce; `None` for full runs
    pub limit_products: Option<usize>,

    #[serde(flatten)]
    pub brands: BrandFilter,

    #[serde(flatten)]
    pub own_products: OwnProductFilter,
}

/// Active-brand filter set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrandFilter {
    #[serde(rename = "filter_by_active_brands")]
    pub enabled: bool,
    #[serde(rename = "active_brand_names")]
    pub names: Vec<String>,
    #[serde(rename = "active_brand_ids")]
    pub ids: Vec<Uuid>,
}

/// Own-product filter set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnProductFilter {
    #[serde(rename = "scrape_only_own_products")]
    pub enabled: bool,
    #[serde(rename = "own_product_eans")]
    pub eans: Vec<String>,
    #[serde(rename = "own_product_sku_brands")]
    pub sku_brands: Vec<SkuBrand>,
}

/// A (sku, brand) pair identifying one of the user's own products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuBrand {
    pub sku: String,
    pub brand: Option<String>,
    pub brand_id: Option<Uuid>,
}

/// An active brand row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveBrand {
    pub id: Uuid,
    pub name: String,
}

/// An own-product row as stored, before filtering into identifier sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnProduct {
    pub ean: Option<String>,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub brand_id: Option<Uuid>,
}

impl BrandFilter {
    /// Builds an enabled filter from the user's active brands
    pub fn from_brands(brands: Vec<ActiveBrand>) -> Self {
        let (ids, names) = brands.into_iter().map(|b| (b.id, b.name)).unzip();
        Self {
            enabled: true,
            names,
            ids,
        }
    }
}

impl OwnProductFilter {
    /// Builds an enabled filter from the user's active products
    ///
    /// EANs keep every non-blank barcode; SKU/brand pairs need a non-blank
    /// SKU and either a brand name or a brand id.
    pub fn from_products(products: Vec<OwnProduct>) -> Self {
        let mut eans = Vec::new();
        let mut sku_brands = Vec::new();

        for product in products {
            if let Some(ean) = product.ean.filter(|e| !e.trim().is_empty()) {
                eans.push(ean);
            }

            let has_brand = product
                .brand
                .as_deref()
                .is_some_and(|b| !b.trim().is_empty())
                || product.brand_id.is_some();

            if let Some(sku) = product.sku.filter(|s| !s.trim().is_empty()) {
                if has_brand {
                    sku_brands.push(SkuBrand {
                        sku,
                        brand: product.brand,
                        brand_id: product.brand_id,
                    });
                }
            }
        }

        Self {
            enabled: true,
            eans,
            sku_brands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext {
            run_id: Uuid::nil(),
            scraper_id: Uuid::nil(),
            user_id: Uuid::nil(),
            competitor_id: None,
            is_test_run: true,
            limit_products: Some(10),
            brands: BrandFilter::default(),
            own_products: OwnProductFilter::default(),
        }
    }

    #[test]
    fn test_context_uses_payload_field_names() {
        let value = serde_json::to_value(context()).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "run_id",
            "scraper_id",
            "user_id",
            "competitor_id",
            "is_test_run",
            "limit_products",
            "filter_by_active_brands",
            "active_brand_names",
            "active_brand_ids",
            "scrape_only_own_products",
            "own_product_eans",
            "own_product_sku_brands",
        ] {
            assert!(object.contains_key(key), "missing key {}", key);
        }
        assert_eq!(object["limit_products"], 10);
    }

    #[test]
    fn test_own_product_filter_keeps_identifiable_rows() {
        let brand_id = Uuid::new_v4();
        let filter = OwnProductFilter::from_products(vec![
            OwnProduct {
                ean: Some("7310865004703".to_string()),
                sku: None,
                brand: None,
                brand_id: None,
            },
            OwnProduct {
                ean: Some("  ".to_string()),
                sku: Some("AB-1".to_string()),
                brand: Some("Acme".to_string()),
                brand_id: None,
            },
            OwnProduct {
                ean: None,
                sku: Some("AB-2".to_string()),
                brand: None,
                brand_id: Some(brand_id),
            },
            OwnProduct {
                ean: None,
                sku: Some("orphan".to_string()),
                brand: None,
                brand_id: None,
            },
        ]);

        assert!(filter.enabled);
        assert_eq!(filter.eans, vec!["7310865004703".to_string()]);
        assert_eq!(filter.sku_brands.len(), 2);
        assert_eq!(filter.sku_brands[1].brand_id, Some(brand_id));
    }

    #[test]
    fn test_brand_filter_splits_names_and_ids() {
        let id = Uuid::new_v4();
        let filter = BrandFilter::from_brands(vec![ActiveBrand {
            id,
            name: "Acme".to_string(),
        }]);

        assert!(filter.enabled);
        assert_eq!(filter.ids, vec![id]);
        assert_eq!(filter.names, vec!["Acme".to_string()]);
    }
}
