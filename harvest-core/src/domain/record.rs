//! Result records and output events
//!
//! A payload reports scraped products on stdout and diagnostics on stderr.
//! The output parser turns each line into an [`OutputEvent`].

use serde::{Deserialize, Serialize};

/// A single scraped product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub name: String,
    pub price: f64,
    pub currency: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub sku: Option<String>,
    pub brand: Option<String>,
    /// External barcode
    pub ean: Option<String>,
    /// Extra payload-specific data stored verbatim
    pub raw_data: Option<serde_json::Value>,
}

impl ResultRecord {
    /// Creates a record with only the required fields set
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
            currency: None,
            url: None,
            image_url: None,
            sku: None,
            brand: None,
            ean: None,
            raw_data: None,
        }
    }

    /// A record must carry a non-blank name and a finite price
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.price.is_finite()
    }
}

/// Batch progress reported by a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Phase number, when the marker named one
    pub phase: Option<u32>,
    pub current: u32,
    pub total: u32,
}

/// A diagnostic line from the payload's stderr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSignal {
    pub text: String,
    pub progress: Option<BatchProgress>,
}

/// A stderr line that reports a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub text: String,
}

/// One classified line of payload output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEvent {
    Record(ResultRecord),
    Progress(ProgressSignal),
    Error(ErrorSignal),
}
