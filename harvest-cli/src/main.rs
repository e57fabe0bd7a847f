//! Harvest CLI
//!
//! Developer tooling for scraper payloads: validate a payload's metadata and
//! dependencies, or run it locally and see how the worker would judge it.
//! Nothing here touches the job store.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Harvest scraper payload tooling", long_about = None)]
struct Cli {
    /// Program used to run payloads; empty runs the payload file directly
    #[arg(long, env = "PAYLOAD_INTERPRETER", default_value = "python3")]
    interpreter: String,

    /// Working directory of payload processes
    #[arg(long, env = "PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::new(&cli.interpreter, cli.project_root);

    handle_command(cli.command, &config).await
}
