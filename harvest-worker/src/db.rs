//! Connection guard
//!
//! Verifies a pooled database handle before each unit of work and replaces it
//! when it has gone stale.

use crate::repository::StoreError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opens and revalidates the worker's connection pool
#[derive(Debug, Clone)]
pub struct ConnectionGuard {
    database_url: String,
    application_name: String,
    connect_timeout: Duration,
}

impl ConnectionGuard {
    /// Creates a new guard
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection URL
    /// * `application_name` - Reported to the server; the worker id
    /// * `connect_timeout` - Bound for opening a connection and for the liveness probe
    pub fn new(database_url: String, application_name: String, connect_timeout: Duration) -> Self {
        Self {
            database_url,
            application_name,
            connect_timeout,
        }
    }

    /// Returns a verified pool, reusing `pool` when it still answers
    ///
    /// Callers must keep the returned pool; the old one may have been closed.
    pub async fn ensure(&self, pool: Option<PgPool>) -> Result<PgPool, StoreError> {
        if let Some(pool) = pool {
            if !pool.is_closed() {
                let probe = sqlx::query("SELECT 1").execute(&pool);
                match tokio::time::timeout(self.connect_timeout, probe).await {
                    Ok(Ok(_)) => {
                        debug!("Connection probe succeeded");
                        return Ok(pool);
                    }
                    Ok(Err(e)) => warn!("Connection probe failed: {}", e),
                    Err(_) => warn!(
                        "Connection probe timed out after {:?}",
                        self.connect_timeout
                    ),
                }
            } else {
                warn!("Connection pool was closed");
            }

            // A broken pool may hang while closing; do it off the hot path
            tokio::spawn(async move { pool.close().await });
            info!("Reconnecting to database");
        }

        self.open().await
    }

    /// Opens a fresh pool with keep-alive tuning
    pub async fn open(&self) -> Result<PgPool, StoreError> {
        let options = PgConnectOptions::from_str(&self.database_url)?
            .application_name(&self.application_name)
            .options([
                ("tcp_keepalives_idle", "600"),
                ("tcp_keepalives_interval", "30"),
                ("tcp_keepalives_count", "3"),
            ]);

        let connect = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options);

        let pool = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "connection attempt timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("Opened database connection pool");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_connecting() {
        let guard = ConnectionGuard::new(
            "not a url".to_string(),
            "harvest-test".to_string(),
            Duration::from_secs(1),
        );
        assert!(guard.ensure(None).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) refuses connections on any sane test host
        let guard = ConnectionGuard::new(
            "postgres://harvest@127.0.0.1:9/harvest".to_string(),
            "harvest-test".to_string(),
            Duration::from_secs(2),
        );

        match guard.ensure(None).await {
            Err(StoreError::Unavailable(_)) => {}
            other => panic!("expected unavailable, got {:?}", other.map(|_| ())),
        }
    }
}
