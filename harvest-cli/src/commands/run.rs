//! Run command
//!
//! Executes a payload against a synthetic context and prints how the worker
//! would classify its output. Records are shown, never stored.

use anyhow::{Context, Result};
use colored::*;
use harvest_core::domain::context::{BrandFilter, ExecutionContext, OwnProductFilter};
use harvest_payload::{ParsedOutput, ProcessError, Verdict};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;

/// Number of stderr lines shown for failed runs
const STDERR_TAIL_LINES: usize = 10;

/// Options of the run command
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub test_run: bool,
    pub limit: usize,
    pub timeout: Duration,
    pub brands: Vec<String>,
    pub eans: Vec<String>,
    pub show: usize,
}

/// Builds the context a worker would hand to this payload
pub fn synthetic_context(options: &RunOptions) -> ExecutionContext {
    let brands = if options.brands.is_empty() {
        BrandFilter::default()
    } else {
        BrandFilter {
            enabled: true,
            names: options.brands.clone(),
            ids: Vec::new(),
        }
    };

    let own_products = if options.eans.is_empty() {
        OwnProductFilter::default()
    } else {
        OwnProductFilter {
            enabled: true,
            eans: options.eans.clone(),
            sku_brands: Vec::new(),
        }
    };

    ExecutionContext {
        run_id: Uuid::new_v4(),
        scraper_id: Uuid::nil(),
        user_id: Uuid::nil(),
        competitor_id: None,
        is_test_run: options.test_run,
        limit_products: options.test_run.then_some(options.limit),
        brands,
        own_products,
    }
}

/// Describes a verdict the way the worker words the job's failure
pub fn describe_verdict(verdict: Verdict) -> String {
    match verdict {
        Verdict::Success => "completed".to_string(),
        Verdict::ExitCode(code) => format!("failed: script failed with exit code {}", code),
        Verdict::EmbeddedErrors(count) => format!(
            "failed: script exited with code 0 but reported {} error(s) on stderr",
            count
        ),
    }
}

/// Handle the run command
pub async fn handle_run(config: &Config, script_path: &str, options: RunOptions) -> Result<()> {
    let payload = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script file: {}", script_path))?;

    let context = synthetic_context(&options);
    let runner = config.runner(options.timeout);

    println!(
        "{} {} (run {})",
        "▶ Running".bold(),
        script_path.cyan(),
        context.run_id.to_string().dimmed()
    );

    let output = match runner.run(&payload, &context).await {
        Ok(output) => output,
        Err(ProcessError::Timeout { timeout, partial }) => {
            let parsed = ParsedOutput::parse("", &partial.stderr);
            print_stderr_tail(parsed.stderr_tail(STDERR_TAIL_LINES));
            anyhow::bail!("Script execution timed out after {} seconds.", timeout.as_secs());
        }
        Err(e) => return Err(e).context("Failed to run payload"),
    };

    let mut parsed = ParsedOutput::parse(&output.stdout, &output.stderr);
    let verdict = parsed.verdict(output.exit_code);

    if let Some(limit) = context.limit_products {
        parsed.records.truncate(limit);
    }

    println!(
        "  Exit code: {}   Elapsed: {:.1}s",
        output.exit_code,
        output.elapsed.as_secs_f64()
    );
    print_records(&parsed, options.show);

    if let Some(progress) = parsed.progress {
        println!(
            "  Progress: batch {}/{}",
            progress.current.to_string().cyan(),
            progress.total
        );
    }

    for malformed in &parsed.malformed {
        println!("  {} {}", "skipped".yellow(), malformed);
    }

    for error in &parsed.errors {
        println!("  {} {}", "error".red(), error);
    }

    let description = describe_verdict(verdict);
    match verdict {
        Verdict::Success => {
            println!("{}", format!("✓ Job would be {}", description).green().bold());
            Ok(())
        }
        Verdict::ExitCode(_) | Verdict::EmbeddedErrors(_) => {
            print_stderr_tail(parsed.stderr_tail(STDERR_TAIL_LINES));
            println!("{}", format!("✗ Job would be {}", description).red().bold());
            anyhow::bail!("payload run would fail the job")
        }
    }
}

fn print_records(parsed: &ParsedOutput, show: usize) {
    println!(
        "  Records: {}",
        parsed.records.len().to_string().bold()
    );

    for record in parsed.records.iter().take(show) {
        println!(
            "    - {} {} {}",
            record.name,
            format!("{:.2}", record.price).cyan(),
            record.currency.as_deref().unwrap_or("").dimmed()
        );
    }

    if parsed.records.len() > show {
        println!(
            "    {}",
            format!("... and {} more", parsed.records.len() - show).dimmed()
        );
    }
}

fn print_stderr_tail(tail: &[String]) {
    if tail.is_empty() {
        return;
    }

    println!("  Last stderr lines:");
    for line in tail {
        println!("    {}", line.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RunOptions {
        RunOptions {
            test_run: true,
            limit: 3,
            timeout: Duration::from_secs(10),
            brands: Vec::new(),
            eans: Vec::new(),
            show: 5,
        }
    }

    #[test]
    fn test_synthetic_context_caps_test_runs_only() {
        let context = synthetic_context(&options());
        assert_eq!(context.limit_products, Some(3));
        assert!(!context.brands.enabled);
        assert!(!context.own_products.enabled);

        let full = synthetic_context(&RunOptions {
            test_run: false,
            ..options()
        });
        assert_eq!(full.limit_products, None);
    }

    #[test]
    fn test_synthetic_context_enables_given_filters() {
        let context = synthetic_context(&RunOptions {
            brands: vec!["Acme".to_string()],
            eans: vec!["7310865004703".to_string()],
            ..options()
        });

        assert!(context.brands.enabled);
        assert_eq!(context.brands.names, vec!["Acme".to_string()]);
        assert!(context.own_products.enabled);
        assert_eq!(context.own_products.eans.len(), 1);
    }

    #[test]
    fn test_describe_verdict() {
        assert_eq!(describe_verdict(Verdict::Success), "completed");
        assert!(describe_verdict(Verdict::ExitCode(2)).contains("exit code 2"));
        assert!(describe_verdict(Verdict::EmbeddedErrors(1)).contains("1 error(s)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_judges_payload_output() {
        let dir = std::env::temp_dir();
        let script = dir.join(format!("harvest-cli-test-{}.sh", Uuid::new_v4()));
        std::fs::write(
            &script,
            "echo '{\"name\":\"Widget\",\"price\":9.5}'\necho 'Phase 1: 1/1' >&2\n",
        )
        .unwrap();
        let config = Config::new("sh", dir);

        let ok = handle_run(&config, script.to_str().unwrap(), options()).await;

        std::fs::write(&script, "echo 'Traceback (most recent call last):' >&2\n").unwrap();
        let failing = handle_run(&config, script.to_str().unwrap(), options()).await;
        std::fs::remove_file(&script).unwrap();

        assert!(ok.is_ok());
        assert!(failing.is_err());
    }
}
