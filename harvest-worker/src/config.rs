//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling,
//! payload execution, persistence and health-check settings.

use harvest_payload::runner::DRAIN_GRACE;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::repository::MAX_INSERT_BATCH;
use crate::retry::RetryPolicy;

const CLAIM_ATTEMPTS: u32 = 4;
const INSERT_ATTEMPTS: u32 = 3;
const REPORT_ATTEMPTS: u32 = 3;
const CONFIG_FETCH_ATTEMPTS: u32 = 3;

/// Time allowed for writing result chunks after the payload has exited
const PERSIST_ALLOWANCE: Duration = Duration::from_secs(300);

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`, falling back to text
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format '{}'", other),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies this worker instance; reported as the database application name
    pub worker_id: String,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// Sleep between polls when no job is available
    pub poll_interval: Duration,

    /// Wall-clock budget for one scraper run
    pub script_timeout: Duration,

    /// Program used to run payloads; empty runs the payload file directly
    pub interpreter: Vec<String>,

    /// Working directory of payload processes
    pub project_root: PathBuf,

    /// Rows per insert statement
    pub db_batch_size: usize,

    /// Result cap handed to test runs
    pub test_run_product_limit: usize,

    /// Currency code used when a record carries none
    pub default_currency: String,

    /// Bound for opening a connection and for the liveness probe
    pub connect_timeout: Duration,

    /// Base delay between retries of a store operation
    pub retry_delay: Duration,

    /// First delay after a worker-level failure
    pub backoff_base: Duration,

    /// Upper bound for the failure backoff
    pub max_backoff: Duration,

    pub health_check_interval: Duration,

    /// Idle time after which the health probe inspects the backlog
    pub inactivity_threshold: Duration,

    /// Running jobs claimed longer ago than this are failed as orphans
    pub orphan_lease: Option<Duration>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, database_url: String) -> Self {
        Self {
            worker_id,
            database_url,
            poll_interval: Duration::from_secs(30),
            script_timeout: Duration::from_secs(7200), // 2 hours
            interpreter: vec!["python3".to_string()],
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            db_batch_size: 100,
            test_run_product_limit: 10,
            default_currency: "SEK".to_string(),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(300),
            inactivity_threshold: Duration::from_secs(1800),
            orphan_lease: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (required)
    /// - WORKER_ID (optional, default: random)
    /// - WORKER_POLL_INTERVAL (optional, seconds, default: 30)
    /// - SCRIPT_TIMEOUT_SECONDS (optional, default: 7200)
    /// - PAYLOAD_INTERPRETER (optional, default: "python3", empty runs payloads directly)
    /// - PROJECT_ROOT (optional, default: current directory)
    /// - DB_BATCH_SIZE (optional, default: 100)
    /// - TEST_RUN_PRODUCT_LIMIT (optional, default: 10)
    /// - DEFAULT_CURRENCY (optional, default: SEK)
    /// - DB_CONNECT_TIMEOUT (optional, seconds, default: 10)
    /// - RETRY_DELAY_MS (optional, default: 1000)
    /// - BACKOFF_BASE (optional, seconds, default: 2)
    /// - MAX_BACKOFF (optional, seconds, default: 60)
    /// - HEALTH_CHECK_INTERVAL (optional, seconds, default: 300)
    /// - INACTIVITY_THRESHOLD (optional, seconds, default: 1800)
    /// - ORPHAN_LEASE_SECONDS (optional, disabled when unset)
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_worker_id);

        let mut config = Self::new(worker_id, database_url);

        if let Some(secs) = env_parse::<u64>("WORKER_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SCRIPT_TIMEOUT_SECONDS") {
            config.script_timeout = Duration::from_secs(secs);
        }
        if let Ok(interpreter) = std::env::var("PAYLOAD_INTERPRETER") {
            config.interpreter = interpreter.split_whitespace().map(String::from).collect();
        }
        if let Ok(root) = std::env::var("PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }
        if let Some(size) = env_parse::<usize>("DB_BATCH_SIZE") {
            config.db_batch_size = size;
        }
        if let Some(limit) = env_parse::<usize>("TEST_RUN_PRODUCT_LIMIT") {
            config.test_run_product_limit = limit;
        }
        if let Ok(currency) = std::env::var("DEFAULT_CURRENCY") {
            config.default_currency = currency.trim().to_uppercase();
        }
        if let Some(secs) = env_parse::<u64>("DB_CONNECT_TIMEOUT") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("BACKOFF_BASE") {
            config.backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("MAX_BACKOFF") {
            config.max_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("HEALTH_CHECK_INTERVAL") {
            config.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("INACTIVITY_THRESHOLD") {
            config.inactivity_threshold = Duration::from_secs(secs);
        }
        config.orphan_lease = env_parse::<u64>("ORPHAN_LEASE_SECONDS").map(Duration::from_secs);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            anyhow::bail!("database_url must start with postgres:// or postgresql://");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.script_timeout.is_zero() {
            anyhow::bail!("script_timeout must be greater than 0");
        }

        if self.connect_timeout.is_zero() {
            anyhow::bail!("connect_timeout must be greater than 0");
        }

        if self.db_batch_size == 0 {
            anyhow::bail!("db_batch_size must be greater than 0");
        }

        if self.db_batch_size > MAX_INSERT_BATCH {
            anyhow::bail!(
                "db_batch_size must not exceed {} (PostgreSQL bind parameter limit)",
                MAX_INSERT_BATCH
            );
        }

        if self.default_currency.trim().is_empty() {
            anyhow::bail!("default_currency cannot be empty");
        }

        if self.backoff_base.is_zero() {
            anyhow::bail!("backoff_base must be greater than 0");
        }

        if self.max_backoff < self.backoff_base {
            anyhow::bail!("max_backoff must not be below backoff_base");
        }

        if self.health_check_interval.is_zero() {
            anyhow::bail!("health_check_interval must be greater than 0");
        }

        if let Some(lease) = self.orphan_lease {
            let minimum = self.min_orphan_lease();
            if lease < minimum {
                anyhow::bail!(
                    "orphan lease must be at least {}s (script timeout plus drain and retry budget)",
                    minimum.as_secs()
                );
            }
        }

        Ok(())
    }

    /// Shortest lease that cannot expire while a live worker is still on the job
    ///
    /// Covers the script timeout, draining both output streams, and every
    /// store retry the job may go through before its final report.
    pub fn min_orphan_lease(&self) -> Duration {
        let retry_budget: Duration = [
            self.config_fetch_retry(),
            self.insert_retry(),
            self.report_retry(),
        ]
        .iter()
        .map(|policy| {
            let revalidations = policy.max_attempts.saturating_sub(1);
            policy
                .total_delay()
                .saturating_add(self.connect_timeout.saturating_mul(revalidations))
        })
        .sum();

        self.script_timeout
            .saturating_add(DRAIN_GRACE.saturating_mul(2))
            .saturating_add(retry_budget)
            .saturating_add(PERSIST_ALLOWANCE)
    }

    pub fn claim_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(CLAIM_ATTEMPTS, self.retry_delay)
    }

    pub fn insert_retry(&self) -> RetryPolicy {
        RetryPolicy::linear(INSERT_ATTEMPTS, self.retry_delay)
    }

    pub fn report_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(REPORT_ATTEMPTS, self.retry_delay)
    }

    pub fn config_fetch_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(CONFIG_FETCH_ATTEMPTS, self.retry_delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            default_worker_id(),
            "postgres://localhost:5432/harvest".to_string(),
        )
    }
}

fn default_worker_id() -> String {
    format!("harvest-worker-{}", uuid::Uuid::new_v4().simple())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
