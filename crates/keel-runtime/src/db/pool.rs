use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio_util::sync::CancellationToken;

use keel_core::config::DatabaseConfig;
use keel_core::database::{Connection, ConnectionManager};
use keel_core::error::{KeelError, Result};
use keel_core::BoxFuture;

/// Pooled connections to the target database.
#[derive(Clone)]
pub struct PgConnectionManager {
    pool: PgPool,
    schema: String,
}

impl PgConnectionManager {
    /// Create a connection manager from configuration.
    ///
    /// The pool connects lazily so that a database created later by the
    /// provisioner can still be used.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let options = Self::connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Connection options for the configured URL with session settings applied.
    pub fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| KeelError::Config(format!("Invalid database url: {}", e)))?;

        options = options.options([("search_path", config.schema.as_str())]);
        if config.statement_timeout_secs > 0 {
            let timeout = format!("{}s", config.statement_timeout_secs);
            options = options.options([("statement_timeout", timeout.as_str())]);
        }
        Ok(options)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Schema that holds the journal tables.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| KeelError::DatabaseConnection(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl ConnectionManager for PgConnectionManager {
    fn create_connection<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(KeelError::Cancelled),
                conn = self.pool.acquire() => conn.map_err(|e| {
                    KeelError::DatabaseConnection(format!("Failed to acquire connection: {}", e))
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_reject_bad_url() {
        let config = DatabaseConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            PgConnectionManager::connect_options(&config),
            Err(KeelError::Config(_))
        ));
    }

    #[test]
    fn test_connect_options_keep_database() {
        let config = DatabaseConfig {
            url: "postgres://user:pw@localhost:5432/app".to_string(),
            statement_timeout_secs: 10,
            ..Default::default()
        };
        let options = PgConnectionManager::connect_options(&config).unwrap();
        assert_eq!(options.get_database(), Some("app"));
    }
}
