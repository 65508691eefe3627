use std::time::Instant;

use sqlx::{Connection as _, Executor as _, PgConnection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_core::database::ConnectionManager;
use keel_core::error::{KeelError, Result};
use keel_core::executor::{ExecutableScript, ExecutionOutcome, ScriptExecutor};
use keel_core::BoxFuture;

use super::batch::{contains_transaction_control, split_batches, Batch};
use crate::db::{cancellable, quote_identifier};

/// Executes scripts against PostgreSQL.
///
/// A script runs inside one transaction unless it contains its own
/// transaction control, in which case batches run as written and a failure
/// closes the connection so no half-open transaction survives. A script with
/// nothing but comments succeeds without acquiring a connection.
pub struct PgScriptExecutor {
    schema: String,
}

impl PgScriptExecutor {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    async fn run(
        &self,
        script: &ExecutableScript,
        connections: &dyn ConnectionManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let batches = split_batches(&script.text);
        if batches.is_empty() {
            debug!(script = %script.name, "Script has no statements to run");
            return Ok(());
        }

        let mut conn = connections.create_connection(cancel).await?;

        if contains_transaction_control(&script.text) {
            debug!(script = %script.name, "Script manages its own transactions");
            let result = cancellable(cancel, run_batches(&mut conn, &batches)).await;
            if result.is_err() {
                if let Err(e) = conn.close().await {
                    warn!("Failed to close connection after script failure: {}", e);
                }
            }
            return result;
        }

        cancellable(cancel, async {
            let mut tx = conn.begin().await?;
            run_batches(&mut tx, &batches).await?;
            tx.commit().await?;
            Ok::<(), KeelError>(())
        })
        .await
    }
}

async fn run_batches(conn: &mut PgConnection, batches: &[Batch]) -> Result<()> {
    for (index, batch) in batches.iter().enumerate() {
        for _ in 0..batch.repeat {
            (&mut *conn)
                .execute(sqlx::raw_sql(&batch.sql))
                .await
                .map_err(|e| {
                    KeelError::Database(format!(
                        "batch {} (line {}) failed: {}",
                        index + 1,
                        batch.line,
                        e
                    ))
                })?;
        }
    }
    Ok(())
}

impl ScriptExecutor for PgScriptExecutor {
    fn execute<'a>(
        &'a self,
        script: &'a ExecutableScript,
        connections: &'a dyn ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ExecutionOutcome> {
        Box::pin(async move {
            let start = Instant::now();
            match self.run(script, connections, cancel).await {
                Ok(()) => ExecutionOutcome::succeeded(start.elapsed()),
                Err(e) => ExecutionOutcome::failed(e, start.elapsed()),
            }
        })
    }

    fn verify_schema<'a>(
        &'a self,
        connections: &'a dyn ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        let schema = self.schema.clone();
        Box::pin(async move {
            connections
                .execute_with_managed_connection(
                    move |conn| {
                        Box::pin(async move {
                            let exists: bool = sqlx::query_scalar(
                                "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
                            )
                            .bind(&schema)
                            .fetch_one(&mut *conn)
                            .await?;

                            if !exists {
                                debug!(schema = %schema, "Creating schema");
                                let ddl = format!(
                                    "CREATE SCHEMA IF NOT EXISTS {}",
                                    quote_identifier(&schema)
                                );
                                sqlx::query(&ddl).execute(&mut *conn).await?;
                            }
                            Ok::<(), KeelError>(())
                        })
                    },
                    cancel,
                )
                .await
        })
    }
}
