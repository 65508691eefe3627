//! PostgreSQL-backed journals.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::error::{KeelError, Result};
use keel_core::journal::{MigrationJournal, SeedJournal};
use keel_core::migration::{Migration, MigrationJournalEntry, MigrationResult};
use keel_core::seed::SeedJournalEntry;
use keel_core::BoxFuture;

use crate::db::{cancellable, qualified_name, PgConnectionManager};

fn journal_error(action: &str, e: sqlx::Error) -> KeelError {
    KeelError::Journal(format!("Failed to {}: {}", action, e))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

async fn table_exists(pool: &PgPool, qualified: &str) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
        .bind(qualified)
        .fetch_one(pool)
        .await
        .map_err(|e| journal_error("check journal table", e))
}

/// Migration journal stored in a PostgreSQL table.
pub struct PgMigrationJournal {
    pool: PgPool,
    table: String,
}

impl PgMigrationJournal {
    /// Journal in `table` inside the connection manager's schema.
    pub fn new(connections: &PgConnectionManager, table: &str) -> Self {
        Self {
            pool: connections.pool().clone(),
            table: qualified_name(connections.schema(), table),
        }
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                upgrade_script_hash VARCHAR(64) NOT NULL UNIQUE,
                migration_name VARCHAR(255) NOT NULL,
                downgrade_script TEXT NULL,
                migrated_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time BIGINT NOT NULL
            )
            "#,
            self.table
        )
    }

    fn entry_from_row(row: &PgRow) -> Result<MigrationJournalEntry> {
        let read = |e: sqlx::Error| journal_error("read journal entry", e);
        Ok(MigrationJournalEntry {
            id: row.try_get("id").map_err(read)?,
            upgrade_script_hash: row.try_get("upgrade_script_hash").map_err(read)?,
            migration_name: row.try_get("migration_name").map_err(read)?,
            downgrade_script: row.try_get("downgrade_script").map_err(read)?,
            migrated_on: row.try_get::<DateTime<Utc>, _>("migrated_on").map_err(read)?,
            execution_time: from_millis(row.try_get("execution_time").map_err(read)?),
        })
    }
}

impl MigrationJournal for PgMigrationJournal {
    fn ensure_table_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(cancellable(cancel, async move {
            sqlx::query(&self.create_table_sql())
                .execute(&self.pool)
                .await
                .map_err(|e| journal_error("create migrations journal", e))?;
            debug!(table = %self.table, "Migration journal ready");
            Ok(())
        }))
    }

    fn has_been_executed<'a>(
        &'a self,
        migration: &'a Migration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(cancellable(cancel, async move {
            if !table_exists(&self.pool, &self.table).await? {
                return Ok(false);
            }
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE upgrade_script_hash = $1)",
                self.table
            );
            sqlx::query_scalar::<_, bool>(&sql)
                .bind(migration.upgrade_hash())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| journal_error("check migration", e))
        }))
    }

    fn store_executed<'a>(
        &'a self,
        migration: &'a Migration,
        downgrade_script: Option<&'a str>,
        result: &'a MigrationResult,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                r#"
                INSERT INTO {} (upgrade_script_hash, migration_name, downgrade_script, migrated_on, execution_time)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                self.table
            );
            sqlx::query(&sql)
                .bind(migration.upgrade_hash())
                .bind(&migration.name)
                .bind(downgrade_script)
                .bind(Utc::now())
                .bind(millis(result.duration))
                .execute(&self.pool)
                .await
                .map_err(|e| journal_error(&format!("record migration '{}'", migration.name), e))?;
            Ok(())
        })
    }

    fn remove_executed<'a>(
        &'a self,
        upgrade_hash: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE upgrade_script_hash = $1", self.table);
            sqlx::query(&sql)
                .bind(upgrade_hash)
                .execute(&self.pool)
                .await
                .map_err(|e| journal_error("remove migration record", e))?;
            Ok(())
        })
    }

    fn get_executed_migrations<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<MigrationJournalEntry>>> {
        Box::pin(cancellable(cancel, async move {
            if !table_exists(&self.pool, &self.table).await? {
                return Ok(Vec::new());
            }
            let sql = format!(
                r#"
                SELECT id, upgrade_script_hash, migration_name, downgrade_script, migrated_on, execution_time
                FROM {}
                ORDER BY migrated_on ASC, id ASC
                "#,
                self.table
            );
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| journal_error("fetch migrations", e))?;

            rows.iter().map(Self::entry_from_row).collect()
        }))
    }
}

/// Seed journal stored in a PostgreSQL table.
pub struct PgSeedJournal {
    pool: PgPool,
    table: String,
}

impl PgSeedJournal {
    /// Journal in `table` inside the connection manager's schema.
    pub fn new(connections: &PgConnectionManager, table: &str) -> Self {
        Self {
            pool: connections.pool().clone(),
            table: qualified_name(connections.schema(), table),
        }
    }

    fn entry_from_row(row: &PgRow) -> Result<SeedJournalEntry> {
        let read = |e: sqlx::Error| journal_error("read seed journal entry", e);
        Ok(SeedJournalEntry {
            id: row.try_get("id").map_err(read)?,
            seed_name: row.try_get("seed_name").map_err(read)?,
            hash: row.try_get("hash").map_err(read)?,
            strategy: row.try_get("strategy").map_err(read)?,
            executed_on: row.try_get::<DateTime<Utc>, _>("executed_on").map_err(read)?,
            duration: from_millis(row.try_get("duration").map_err(read)?),
        })
    }
}

impl SeedJournal for PgSeedJournal {
    fn ensure_table_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(cancellable(cancel, async move {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    seed_name VARCHAR(255) NOT NULL,
                    hash VARCHAR(64) NOT NULL,
                    strategy VARCHAR(32) NOT NULL,
                    executed_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    duration BIGINT NOT NULL
                )
                "#,
                self.table
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| journal_error("create seed journal", e))?;
            Ok(())
        }))
    }

    fn has_been_executed<'a>(
        &'a self,
        seed_name: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(cancellable(cancel, async move {
            if !table_exists(&self.pool, &self.table).await? {
                return Ok(false);
            }
            let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE seed_name = $1)", self.table);
            sqlx::query_scalar::<_, bool>(&sql)
                .bind(seed_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| journal_error("check seed", e))
        }))
    }

    fn get_last_executed_hash<'a>(
        &'a self,
        seed_name: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(cancellable(cancel, async move {
            if !table_exists(&self.pool, &self.table).await? {
                return Ok(None);
            }
            let sql = format!(
                "SELECT hash FROM {} WHERE seed_name = $1 ORDER BY executed_on DESC, id DESC LIMIT 1",
                self.table
            );
            sqlx::query_scalar::<_, String>(&sql)
                .bind(seed_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| journal_error("fetch last seed hash", e))
        }))
    }

    fn store_executed<'a>(
        &'a self,
        entry: &'a SeedJournalEntry,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {} (seed_name, hash, strategy, executed_on, duration) VALUES ($1, $2, $3, $4, $5)",
                self.table
            );
            sqlx::query(&sql)
                .bind(&entry.seed_name)
                .bind(&entry.hash)
                .bind(&entry.strategy)
                .bind(entry.executed_on)
                .bind(millis(entry.duration))
                .execute(&self.pool)
                .await
                .map_err(|e| journal_error(&format!("record seed '{}'", entry.seed_name), e))?;
            Ok(())
        })
    }

    fn get_executed_seeds<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<SeedJournalEntry>>> {
        Box::pin(cancellable(cancel, async move {
            if !table_exists(&self.pool, &self.table).await? {
                return Ok(Vec::new());
            }
            let sql = format!(
                "SELECT id, seed_name, hash, strategy, executed_on, duration FROM {} ORDER BY executed_on ASC, id ASC",
                self.table
            );
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| journal_error("fetch seeds", e))?;

            rows.iter().map(Self::entry_from_row).collect()
        }))
    }
}
