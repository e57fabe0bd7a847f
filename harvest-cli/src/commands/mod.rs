//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod run;
mod validate;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check a payload's metadata and installed dependencies
    Validate {
        /// Path to the payload script
        script: String,

        /// Dependency probe; each library name is appended as the last argument
        #[arg(long, default_value = "python3 -m pip show -q")]
        probe: String,

        /// Skip the dependency probe
        #[arg(long)]
        skip_dependencies: bool,
    },
    /// Run a payload locally against a synthetic context
    Run {
        /// Path to the payload script
        script: String,

        /// Run as a test run, capping the results
        #[arg(long)]
        test_run: bool,

        /// Result cap for test runs
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Active brand names handed to the payload (comma-separated)
        #[arg(long, value_delimiter = ',')]
        brands: Vec<String>,

        /// Own-product EANs handed to the payload (comma-separated)
        #[arg(long, value_delimiter = ',')]
        eans: Vec<String>,

        /// Number of records to print
        #[arg(long, default_value = "5")]
        show: usize,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
///
/// # Returns
/// Result indicating success or failure
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Validate {
            script,
            probe,
            skip_dependencies,
        } => {
            let probe = if skip_dependencies {
                Vec::new()
            } else {
                probe.split_whitespace().map(String::from).collect()
            };
            validate::handle_validate(config, &script, &probe).await
        }
        Commands::Run {
            script,
            test_run,
            limit,
            timeout,
            brands,
            eans,
            show,
        } => {
            let options = run::RunOptions {
                test_run,
                limit,
                timeout: std::time::Duration::from_secs(timeout),
                brands,
                eans,
                show,
            };
            run::handle_run(config, &script, options).await
        }
    }
}
