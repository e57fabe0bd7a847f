//! Job executor
//!
//! The per-job pipeline run once a job is claimed:
//! config → context → payload run → parse → persist → report.
//!
//! Every failure inside the pipeline becomes the job's `failed` status; the
//! executor itself never returns an error.

use harvest_core::domain::job::Job;
use harvest_core::domain::record::BatchProgress;
use harvest_core::dto::job::JobConfig;
use harvest_payload::parser::{ParsedOutput, Verdict};
use harvest_payload::runner::{ProcessError, ProcessRunner, RunnerSettings};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::context_builder::ContextBuilder;
use super::persister::ResultPersister;
use super::reporter::{JobFailure, JobOutcome, StatusReporter};
use crate::config::Config;
use crate::repository::JobStore;
use crate::retry::RetryPolicy;
use crate::scheduler::WorkerState;

/// Number of stderr lines kept in failure details
const STDERR_TAIL_LINES: usize = 10;

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    config_retry: RetryPolicy,
    context_builder: ContextBuilder,
    runner: ProcessRunner,
    persister: ResultPersister,
    reporter: Arc<StatusReporter>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl JobExecutor {
    /// Wires the pipeline from configuration
    ///
    /// # Arguments
    /// * `config` - Worker configuration
    /// * `store` - Job store shared with the rest of the worker
    /// * `state` - Receives the pipeline stage as the job advances
    pub fn new(
        config: &Config,
        store: Arc<dyn JobStore>,
        state: Arc<watch::Sender<WorkerState>>,
    ) -> Self {
        let runner = ProcessRunner::new(RunnerSettings::new(
            config.interpreter.clone(),
            config.project_root.clone(),
            config.script_timeout,
        ));

        Self {
            config_retry: config.config_fetch_retry(),
            context_builder: ContextBuilder::new(
                Arc::clone(&store),
                config.test_run_product_limit,
            ),
            runner,
            persister: ResultPersister::new(
                Arc::clone(&store),
                config.insert_retry(),
                config.db_batch_size,
                config.default_currency.clone(),
            ),
            reporter: Arc::new(StatusReporter::new(
                Arc::clone(&store),
                config.report_retry(),
            )),
            store,
            state,
        }
    }

    pub fn reporter(&self) -> Arc<StatusReporter> {
        Arc::clone(&self.reporter)
    }

    /// Processes a claimed job to its terminal status
    pub async fn execute(&self, job: Job) -> JobOutcome {
        let span = info_span!("job", run_id = %job.id, scraper_id = %job.scraper_id);
        self.process(job).instrument(span).await
    }

    async fn process(&self, job: Job) -> JobOutcome {
        let started = Instant::now();
        info!("Processing job (test run: {})", job.is_test_run);

        let (outcome, progress) = self.run_pipeline(&job).await;

        self.state.send_replace(WorkerState::Reporting);
        self.reporter
            .finalize(&job, &outcome, started.elapsed(), progress)
            .await;

        match &outcome {
            JobOutcome::Completed { product_count } => info!(
                "Job completed with {} products in {:?}",
                product_count,
                started.elapsed()
            ),
            JobOutcome::Failed { failure, .. } => warn!("Job failed: {}", failure.message()),
        }

        outcome
    }

    async fn run_pipeline(&self, job: &Job) -> (JobOutcome, Option<BatchProgress>) {
        let failed = |failure: JobFailure| -> (JobOutcome, Option<BatchProgress>) {
            (
                JobOutcome::Failed {
                    failure,
                    product_count: 0,
                },
                None,
            )
        };

        let Some((config, script)) = self.fetch_script(job).await else {
            return failed(JobFailure::MissingScript {
                scraper_id: job.scraper_id,
            });
        };

        let context = self.context_builder.build(job, &config).await;

        info!("Running scraper script");
        let output = match self.runner.run(&script, &context).await {
            Ok(output) => output,
            Err(ProcessError::Timeout { timeout, partial }) => {
                let parsed = ParsedOutput::parse("", &partial.stderr);
                return failed(JobFailure::Timeout {
                    seconds: timeout.as_secs(),
                    stderr_tail: parsed.stderr_tail(STDERR_TAIL_LINES).to_vec(),
                });
            }
            Err(e) => {
                error!("Failed to run scraper script: {}", e);
                return failed(JobFailure::Worker(e.to_string()));
            }
        };

        let parsed = ParsedOutput::parse(&output.stdout, &output.stderr);
        for line in &parsed.diagnostics {
            debug!("Script stderr: {}", line);
        }
        info!(
            "Script exited with code {}: {} records, {} diagnostics, {} malformed lines",
            output.exit_code,
            parsed.records.len(),
            parsed.diagnostics.len(),
            parsed.malformed.len()
        );

        if let Some(progress) = parsed.progress {
            self.reporter.report_progress(job, progress).await;
        }

        let verdict = parsed.verdict(output.exit_code);
        let stderr_tail = parsed.stderr_tail(STDERR_TAIL_LINES).to_vec();
        let ParsedOutput {
            mut records,
            errors,
            progress,
            ..
        } = parsed;

        if let Some(limit) = context.limit_products {
            if records.len() > limit {
                info!(
                    "Test run produced {} records, keeping the first {}",
                    records.len(),
                    limit
                );
                records.truncate(limit);
            }
        }

        self.state.send_replace(WorkerState::Persisting);
        let product_count = self.persister.save(job, records).await;

        let outcome = match verdict {
            Verdict::Success => JobOutcome::Completed { product_count },
            Verdict::ExitCode(code) => JobOutcome::Failed {
                failure: JobFailure::ExitCode { code, stderr_tail },
                product_count,
            },
            Verdict::EmbeddedErrors(count) => {
                warn!("Script reported {} errors on stderr", count);
                JobOutcome::Failed {
                    failure: JobFailure::ReportedErrors { lines: errors },
                    product_count,
                }
            }
        };

        (outcome, progress)
    }

    /// Loads the job's configuration and its runnable script
    async fn fetch_script(&self, job: &Job) -> Option<(JobConfig, String)> {
        let fetched = self
            .config_retry
            .run(self.store.as_ref(), "Fetch job config", || {
                self.store.fetch_job_config(job.scraper_id)
            })
            .await;

        match fetched {
            Ok(Some(config)) => match config.runnable_script() {
                Some(script) => {
                    let script = script.to_string();
                    Some((config, script))
                }
                None => {
                    error!("Scraper {} has no script", job.scraper_id);
                    None
                }
            },
            Ok(None) => {
                error!("Scraper {} not found", job.scraper_id);
                None
            }
            Err(e) => {
                error!("Failed to fetch config for scraper {}: {}", job.scraper_id, e);
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryJobStore;
    use harvest_core::domain::job::JobStatus;
    use std::path::Path;
    use std::time::Duration;
    use uuid::Uuid;

    fn config(timeout: Duration) -> Config {
        let mut config = Config::default();
        config.interpreter = vec!["sh".to_string()];
        config.project_root = std::env::temp_dir();
        config.script_timeout = timeout;
        config.test_run_product_limit = 5;
        config.retry_delay = Duration::from_millis(10);
        config
    }

    fn executor(store: &MemoryJobStore, timeout: Duration) -> JobExecutor {
        let (state, _) = watch::channel(WorkerState::Idle);
        JobExecutor::new(&config(timeout), Arc::new(store.clone()), Arc::new(state))
    }

    fn running_job(store: &MemoryJobStore, script: Option<&str>, is_test_run: bool) -> Job {
        let mut job = Job::pending(Uuid::new_v4(), Uuid::new_v4(), is_test_run);
        job.status = JobStatus::Running;
        store.add_job(
            job.clone(),
            JobConfig {
                script: script.map(String::from),
                ..JobConfig::default()
            },
        );
        job
    }

    fn record_lines(count: usize) -> String {
        (0..count)
            .map(|i| format!("echo '{{\"name\":\"Item {}\",\"price\":{}}}'\n", i, i + 1))
            .collect()
    }

    #[tokio::test]
    async fn test_test_run_is_capped_and_completed() {
        let store = MemoryJobStore::new();
        let job = running_job(&store, Some(&record_lines(8)), true);

        let outcome = executor(&store, Duration::from_secs(10)).execute(job.clone()).await;

        assert_eq!(outcome, JobOutcome::Completed { product_count: 5 });
        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.product_count, 5);
        assert_eq!(store.state().inserted.len(), 5);
    }

    #[tokio::test]
    async fn test_full_run_is_not_capped() {
        let store = MemoryJobStore::new();
        let job = running_job(&store, Some(&record_lines(8)), false);

        let outcome = executor(&store, Duration::from_secs(10)).execute(job).await;

        assert_eq!(outcome, JobOutcome::Completed { product_count: 8 });
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_removes_payload() {
        let marker_dir = tempfile::tempdir().unwrap();
        let marker = marker_dir.path().join("payload-path");
        let script = format!(
            "echo \"$0\" > '{}'\necho 'fetching page 1' >&2\nexec sleep 30\n",
            marker.display()
        );

        let store = MemoryJobStore::new();
        let job = running_job(&store, Some(&script), false);

        let outcome = executor(&store, Duration::from_millis(1500)).execute(job.clone()).await;

        match &outcome {
            JobOutcome::Failed { failure, .. } => {
                assert!(matches!(failure, JobFailure::Timeout { .. }));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Script execution timed out after 1 seconds.")
        );

        let payload_path = std::fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(payload_path.trim()).exists());
        assert!(store.state().inserted.is_empty());
    }

    #[tokio::test]
    async fn test_exception_on_stderr_overrides_exit_code_zero() {
        let store = MemoryJobStore::new();
        let script = format!("{}echo 'Exception: parse failure' >&2\nexit 0\n", record_lines(2));
        let job = running_job(&store, Some(&script), false);

        let outcome = executor(&store, Duration::from_secs(10)).execute(job.clone()).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                failure: JobFailure::ReportedErrors {
                    lines: vec!["Exception: parse failure".to_string()],
                },
                product_count: 2,
            }
        );
        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Script exited with code 0 but reported errors on stderr.")
        );
        assert_eq!(
            store.state().progress_messages[&job.id],
            vec!["Exception: parse failure".to_string()]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr_tail() {
        let store = MemoryJobStore::new();
        let job = running_job(&store, Some("echo 'giving up' >&2\nexit 3\n"), false);

        let outcome = executor(&store, Duration::from_secs(10)).execute(job.clone()).await;

        match outcome {
            JobOutcome::Failed {
                failure: JobFailure::ExitCode { code, stderr_tail },
                ..
            } => {
                assert_eq!(code, 3);
                assert_eq!(stderr_tail, vec!["giving up".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            store.job(job.id).unwrap().error_message.as_deref(),
            Some("Script failed with exit code 3.")
        );
    }

    #[tokio::test]
    async fn test_missing_script_fails_without_running() {
        let store = MemoryJobStore::new();
        let job = running_job(&store, None, false);

        let outcome = executor(&store, Duration::from_secs(10)).execute(job.clone()).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                failure: JobFailure::MissingScript {
                    scraper_id: job.scraper_id
                },
                product_count: 0,
            }
        );
        assert_eq!(store.job(job.id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_progress_is_recorded() {
        let store = MemoryJobStore::new();
        let script = format!(
            "{}echo 'Phase 1: 4/4' >&2\necho 'Updated progress in database: Phase 2: 3/7' >&2\n",
            record_lines(1)
        );
        let job = running_job(&store, Some(&script), false);

        executor(&store, Duration::from_secs(10)).execute(job.clone()).await;

        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.current_batch, Some(3));
        assert_eq!(stored.total_batches, Some(7));
        // One intermediate update, one terminal update
        assert_eq!(store.state().updates.len(), 2);
    }
}
