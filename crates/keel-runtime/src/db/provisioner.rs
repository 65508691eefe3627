use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_core::config::DatabaseConfig;
use keel_core::database::DatabaseProvisioner;
use keel_core::error::{KeelError, Result};
use keel_core::BoxFuture;

use super::pool::PgConnectionManager;
use super::{cancellable, quote_identifier};

/// Creates the target database through a maintenance database.
pub struct PgDatabaseProvisioner {
    maintenance: PgConnectOptions,
    database: String,
}

impl PgDatabaseProvisioner {
    /// Create a provisioner for `database`, connecting through `maintenance`.
    pub fn new(maintenance: PgConnectOptions, database: impl Into<String>) -> Self {
        Self {
            maintenance,
            database: database.into(),
        }
    }

    /// Derive the target and maintenance databases from configuration.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectionManager::connect_options(config)?;
        let database = options
            .get_database()
            .map(str::to_string)
            .ok_or_else(|| KeelError::Config("Database url does not name a database".into()))?;

        Ok(Self::new(
            options.database(&config.maintenance_database),
            database,
        ))
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect_with(&self.maintenance)
            .await
            .map_err(|e| {
                KeelError::DatabaseConnection(format!(
                    "Failed to connect to maintenance database: {}",
                    e
                ))
            })
    }
}

impl DatabaseProvisioner for PgDatabaseProvisioner {
    fn database_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<bool>> {
        Box::pin(cancellable(cancel, async move {
            let mut conn = self.connect().await?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                    .bind(&self.database)
                    .fetch_one(&mut conn)
                    .await
                    .map_err(|e| {
                        KeelError::Provisioning(format!("Failed to look up database: {}", e))
                    })?;
            close_maintenance(conn).await;
            Ok(exists)
        }))
    }

    fn create_database<'a>(
        &'a self,
        template: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(cancellable(cancel, async move {
            let statement = create_database_statement(&self.database, template);
            info!(database = %self.database, template = ?template, "Creating database");

            let mut conn = self.connect().await?;
            sqlx::query(&statement)
                .execute(&mut conn)
                .await
                .map_err(|e| {
                    KeelError::Provisioning(format!(
                        "Failed to create database '{}': {}",
                        self.database, e
                    ))
                })?;
            close_maintenance(conn).await;
            Ok(())
        }))
    }
}

async fn close_maintenance(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        debug!("Failed to close maintenance connection: {}", e);
    }
}

fn create_database_statement(database: &str, template: Option<&str>) -> String {
    match template {
        Some(template) => format!(
            "CREATE DATABASE {} TEMPLATE {}",
            quote_identifier(database),
            quote_identifier(template)
        ),
        None => format!("CREATE DATABASE {}", quote_identifier(database)),
    }
}
