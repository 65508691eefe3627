//! Connection and database provisioning contracts.

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};
use tokio_util::sync::CancellationToken;

use crate::error::{KeelError, Result};
use crate::BoxFuture;

/// A pooled PostgreSQL connection, returned to its pool on drop.
pub type Connection = PoolConnection<Postgres>;

/// Hands out connections to the target database.
pub trait ConnectionManager: Send + Sync {
    /// Acquire a connection. Dropping it releases it.
    fn create_connection<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Connection>>;
}

impl<'m> dyn ConnectionManager + 'm {
    /// Run `operation` on a freshly acquired connection.
    ///
    /// The connection is released on every exit path. On cancellation the
    /// in-flight operation is dropped and the connection is closed instead of
    /// being returned to the pool.
    pub async fn execute_with_managed_connection<T, F>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut conn = self.create_connection(cancel).await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = operation(&mut *conn) => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                if let Err(e) = conn.close().await {
                    tracing::debug!("Failed to close cancelled connection: {}", e);
                }
                Err(KeelError::Cancelled)
            }
        }
    }
}

/// Creates and inspects the target database.
pub trait DatabaseProvisioner: Send + Sync {
    /// Read-only existence check.
    fn database_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<bool>>;

    /// Create the database, optionally from a template database.
    fn create_database<'a>(
        &'a self,
        template: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// Create the database when missing. Returns whether it was created.
    fn ensure_database_exists<'a>(
        &'a self,
        template: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.database_exists(cancel).await? {
                return Ok(false);
            }
            self.create_database(template, cancel).await?;
            Ok(true)
        })
    }
}
