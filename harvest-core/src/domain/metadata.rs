//! Payload metadata
//!
//! Returned by `<payload> metadata`; used to validate a scraper before it
//! is scheduled, never to execute it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Site the scraper targets
    #[serde(default, alias = "target")]
    pub target_url: Option<String>,

    /// Third-party libraries the payload imports at scrape time
    #[serde(default, alias = "dependencies")]
    pub required_libraries: Vec<String>,

    /// Any other keys the payload reports
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PayloadMetadata {
    /// Lists problems that make the metadata unusable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("'name' must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("'version' must not be empty".to_string());
        }
        if self.required_libraries.iter().any(|l| l.trim().is_empty()) {
            problems.push("'required_libraries' contains an empty entry".to_string());
        }
        problems
    }
}
