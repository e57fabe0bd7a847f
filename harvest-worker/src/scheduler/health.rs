//! Health monitor
//!
//! Periodically logs how long the worker has gone without claiming a job.
//! After a long idle stretch it also counts the eligible backlog. With an
//! orphan lease configured it fails `running` jobs nobody finished.

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::repository::JobStore;

/// Result of one health probe
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Time since the last claim
    pub idle: Duration,
    /// Eligible jobs, when the backlog was inspected
    pub backlog: Option<i64>,
    /// Running jobs failed by the orphan sweep
    pub orphans_failed: u64,
}

pub struct HealthMonitor {
    store: Arc<dyn JobStore>,
    interval: Duration,
    inactivity_threshold: Duration,
    orphan_lease: Option<Duration>,
    last_probe: Instant,
    last_claim: Instant,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        interval: Duration,
        inactivity_threshold: Duration,
        orphan_lease: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            store,
            interval,
            inactivity_threshold,
            orphan_lease,
            last_probe: now,
            last_claim: now,
        }
    }

    pub fn record_claim(&mut self) {
        self.last_claim = Instant::now();
    }

    /// Probes when the health-check interval has elapsed
    pub async fn maybe_probe(&mut self) -> Option<HealthReport> {
        if self.last_probe.elapsed() < self.interval {
            return None;
        }
        self.last_probe = Instant::now();
        Some(self.probe().await)
    }

    pub async fn probe(&self) -> HealthReport {
        let idle = self.last_claim.elapsed();
        info!("Health check: last job claimed {}s ago", idle.as_secs());

        let mut report = HealthReport {
            idle,
            backlog: None,
            orphans_failed: 0,
        };

        if idle > self.inactivity_threshold {
            match self.store.count_eligible_jobs().await {
                Ok(count) if count > 0 => {
                    warn!(
                        "No job claimed for {}s while {} eligible jobs are waiting",
                        idle.as_secs(),
                        count
                    );
                    report.backlog = Some(count);
                }
                Ok(count) => {
                    info!("No eligible jobs waiting");
                    report.backlog = Some(count);
                }
                Err(e) => warn!("Failed to count eligible jobs: {}", e),
            }
        }

        if let Some(lease) = self.orphan_lease {
            report.orphans_failed = self.sweep_orphans(lease).await;
        }

        report
    }

    async fn sweep_orphans(&self, lease: Duration) -> u64 {
        let Some(cutoff) = TimeDelta::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        else {
            return 0;
        };

        let message = format!(
            "Job orphaned: still running {} seconds after it was claimed",
            lease.as_secs()
        );

        match self.store.fail_orphaned_jobs(cutoff, &message).await {
            Ok(0) => 0,
            Ok(count) => {
                warn!("Failed {} orphaned jobs", count);
                count
            }
            Err(e) => {
                warn!("Orphan sweep failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryJobStore;
    use harvest_core::domain::job::{Job, JobStatus};
    use harvest_core::dto::job::JobConfig;
    use uuid::Uuid;

    fn monitor(store: &MemoryJobStore, orphan_lease: Option<Duration>) -> HealthMonitor {
        HealthMonitor::new(
            Arc::new(store.clone()),
            Duration::from_secs(300),
            Duration::from_secs(1800),
            orphan_lease,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_runs_once_per_interval() {
        let store = MemoryJobStore::new();
        let mut monitor = monitor(&store, None);

        assert!(monitor.maybe_probe().await.is_none());
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(monitor.maybe_probe().await.is_some());
        assert!(monitor.maybe_probe().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_checked_only_after_inactivity() {
        let store = MemoryJobStore::new();
        store.add_job(
            Job::pending(Uuid::new_v4(), Uuid::new_v4(), false),
            JobConfig::default(),
        );
        let mut monitor = monitor(&store, None);

        tokio::time::advance(Duration::from_secs(600)).await;
        let report = monitor.maybe_probe().await.unwrap();
        assert_eq!(report.backlog, None);

        tokio::time::advance(Duration::from_secs(1500)).await;
        let report = monitor.maybe_probe().await.unwrap();
        assert_eq!(report.backlog, Some(1));

        monitor.record_claim();
        tokio::time::advance(Duration::from_secs(300)).await;
        let report = monitor.maybe_probe().await.unwrap();
        assert_eq!(report.backlog, None);
    }

    #[tokio::test]
    async fn test_orphan_sweep_fails_stale_running_jobs() {
        let store = MemoryJobStore::new();
        let mut stale = Job::pending(Uuid::new_v4(), Uuid::new_v4(), false);
        stale.status = JobStatus::Running;
        stale.claimed_by_worker_at = Some(Utc::now() - TimeDelta::hours(5));
        let mut fresh = Job::pending(Uuid::new_v4(), Uuid::new_v4(), false);
        fresh.status = JobStatus::Running;
        fresh.claimed_by_worker_at = Some(Utc::now());
        let (stale_id, fresh_id) = (stale.id, fresh.id);
        store.add_job(stale, JobConfig::default());
        store.add_job(fresh, JobConfig::default());

        let report = monitor(&store, Some(Duration::from_secs(3 * 3600)))
            .probe()
            .await;

        assert_eq!(report.orphans_failed, 1);
        let stale = store.job(stale_id).unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert!(stale.error_message.unwrap().starts_with("Job orphaned"));
        assert_eq!(store.job(fresh_id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_no_sweep_without_lease() {
        let store = MemoryJobStore::new();
        let mut stale = Job::pending(Uuid::new_v4(), Uuid::new_v4(), false);
        stale.status = JobStatus::Running;
        stale.claimed_by_worker_at = Some(Utc::now() - TimeDelta::days(2));
        let stale_id = stale.id;
        store.add_job(stale, JobConfig::default());

        let report = monitor(&store, None).probe().await;

        assert_eq!(report.orphans_failed, 0);
        assert_eq!(store.job(stale_id).unwrap().status, JobStatus::Running);
    }
}
