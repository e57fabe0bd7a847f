//! Configuration module
//!
//! Settings shared by every command: how payloads are launched and where.

use harvest_payload::{ProcessRunner, RunnerSettings};
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Interpreter program and leading arguments
    pub interpreter: Vec<String>,

    /// Working directory of payload processes
    pub project_root: PathBuf,
}

impl Config {
    /// Splits the interpreter command line on whitespace
    pub fn new(interpreter: &str, project_root: PathBuf) -> Self {
        Self {
            interpreter: interpreter.split_whitespace().map(String::from).collect(),
            project_root,
        }
    }

    /// Builds a payload runner bounded by `timeout`
    pub fn runner(&self, timeout: Duration) -> ProcessRunner {
        ProcessRunner::new(RunnerSettings::new(
            self.interpreter.clone(),
            self.project_root.clone(),
            timeout,
        ))
    }
}
