//! Validate command
//!
//! Queries a payload's metadata and probes for the libraries it declares.

use anyhow::{Context, Result};
use colored::*;
use harvest_core::domain::metadata::PayloadMetadata;
use harvest_payload::metadata::{METADATA_TIMEOUT, check_dependencies, query_metadata};

use crate::config::Config;

/// Outcome of validating one payload
#[derive(Debug)]
pub struct ValidationReport {
    pub metadata: PayloadMetadata,
    /// Declared libraries the probe could not find
    pub missing: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Validates payload source code
///
/// # Arguments
/// * `config` - The CLI configuration
/// * `payload` - Payload source code
/// * `probe` - Dependency probe command; empty skips the probe
pub async fn validate_payload(
    config: &Config,
    payload: &str,
    probe: &[String],
) -> Result<ValidationReport> {
    let runner = config.runner(METADATA_TIMEOUT);
    let metadata = query_metadata(&runner, payload)
        .await
        .context("Failed to query payload metadata")?;

    let missing = check_dependencies(probe, &config.project_root, &metadata.required_libraries)
        .await
        .context("Failed to run dependency probe")?;

    Ok(ValidationReport { metadata, missing })
}

/// Handle the validate command
pub async fn handle_validate(config: &Config, script_path: &str, probe: &[String]) -> Result<()> {
    let payload = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script file: {}", script_path))?;

    let report = validate_payload(config, &payload, probe).await?;
    print_report(&report, !probe.is_empty());

    if !report.is_valid() {
        anyhow::bail!(
            "{} required libraries are missing",
            report.missing.len()
        );
    }

    Ok(())
}

fn print_report(report: &ValidationReport, probed: bool) {
    let metadata = &report.metadata;

    println!("{}", "✓ Metadata is valid".green().bold());
    println!("  Name:    {}", metadata.name.bold());
    println!("  Version: {}", metadata.version.cyan());
    if let Some(description) = &metadata.description {
        println!("  About:   {}", description.dimmed());
    }
    if let Some(target) = &metadata.target_url {
        println!("  Target:  {}", target.cyan());
    }

    if metadata.required_libraries.is_empty() {
        println!("  Libraries: {}", "none".dimmed());
        return;
    }

    println!("  Libraries:");
    for library in &metadata.required_libraries {
        let marker = if !probed {
            "?".dimmed()
        } else if report.missing.contains(library) {
            "✗".red()
        } else {
            "✓".green()
        };
        println!("    {} {}", marker, library);
    }

    if !probed {
        println!("{}", "Dependency probe skipped".yellow());
    }
}
