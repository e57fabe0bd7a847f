//! Payload metadata query
//!
//! A payload answers `<payload> metadata` with a single JSON object
//! describing itself. Validation tooling uses it together with a dependency
//! probe to reject scrapers before they are ever scheduled.

use crate::runner::{ProcessError, ProcessRunner};
use harvest_core::domain::metadata::PayloadMetadata;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Wall-clock budget for the metadata command and for each dependency probe
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("metadata command exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("metadata output contains no JSON object")]
    NoObject,

    #[error("metadata object is malformed: {0}")]
    Malformed(String),

    #[error("invalid metadata: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Runs `<payload> metadata` and validates the answer
pub async fn query_metadata(
    runner: &ProcessRunner,
    payload: &str,
) -> Result<PayloadMetadata, MetadataError> {
    let output = runner
        .run_with_args(payload, &["metadata".to_string()], METADATA_TIMEOUT)
        .await?;

    if output.exit_code != 0 {
        return Err(MetadataError::Failed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    parse_metadata(&output.stdout)
}

/// Extracts the metadata object from stdout
///
/// The first line holding a JSON object wins; otherwise the whole output is
/// tried, which accepts pretty-printed objects.
pub fn parse_metadata(stdout: &str) -> Result<PayloadMetadata, MetadataError> {
    let object = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(Value::is_object)
        .or_else(|| {
            serde_json::from_str::<Value>(stdout.trim())
                .ok()
                .filter(Value::is_object)
        })
        .ok_or(MetadataError::NoObject)?;

    let metadata: PayloadMetadata =
        serde_json::from_value(object).map_err(|e| MetadataError::Malformed(e.to_string()))?;

    let problems = metadata.problems();
    if !problems.is_empty() {
        return Err(MetadataError::Invalid(problems));
    }

    debug!("Parsed metadata for {} {}", metadata.name, metadata.version);
    Ok(metadata)
}

/// Returns the libraries the probe reports as missing
///
/// The probe command is run once per library with the library name as its
/// last argument; a non-zero exit means missing.
///
/// # Arguments
/// * `probe` - Probe program and leading arguments, e.g. `python3 -m pip show -q`
/// * `working_dir` - Directory the probe runs in
/// * `libraries` - Library names to check
pub async fn check_dependencies(
    probe: &[String],
    working_dir: &Path,
    libraries: &[String],
) -> Result<Vec<String>, ProcessError> {
    let Some((program, leading)) = probe.split_first() else {
        return Ok(Vec::new());
    };

    let mut missing = Vec::new();
    for library in libraries {
        let status = Command::new(program)
            .args(leading)
            .arg(library)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let installed = match tokio::time::timeout(METADATA_TIMEOUT, status).await {
            Ok(status) => status.map_err(ProcessError::Spawn)?.success(),
            Err(_) => false,
        };

        if installed {
            debug!("Dependency {} is installed", library);
        } else {
            info!("Dependency {} is missing", library);
            missing.push(library.clone());
        }
    }

    Ok(missing)
}
