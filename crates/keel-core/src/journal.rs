//! Durable execution logs for migrations and seeds.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::migration::{Migration, MigrationJournalEntry, MigrationResult};
use crate::seed::SeedJournalEntry;
use crate::BoxFuture;

/// Content-addressed log of executed upgrade scripts.
///
/// The upgrade script hash is unique across entries. Failures are reported as
/// [`KeelError::Journal`](crate::KeelError::Journal) and are not retried.
/// Writes record work that has already committed, so implementations run
/// them to completion rather than racing `cancel`.
pub trait MigrationJournal: Send + Sync {
    /// Create the backing table if it does not exist.
    fn ensure_table_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>>;

    fn has_been_executed<'a>(
        &'a self,
        migration: &'a Migration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Record a successful upgrade together with its snapshotted downgrade text.
    fn store_executed<'a>(
        &'a self,
        migration: &'a Migration,
        downgrade_script: Option<&'a str>,
        result: &'a MigrationResult,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// Remove the entry with the given upgrade hash.
    fn remove_executed<'a>(
        &'a self,
        upgrade_hash: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// All entries, oldest first.
    fn get_executed_migrations<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<MigrationJournalEntry>>>;
}

/// Append-only log of seed executions.
pub trait SeedJournal: Send + Sync {
    fn ensure_table_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>>;

    fn has_been_executed<'a>(
        &'a self,
        seed_name: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Hash recorded by the most recent execution of `seed_name`.
    fn get_last_executed_hash<'a>(
        &'a self,
        seed_name: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<String>>>;

    /// Append an entry. The `id` of `entry` is ignored.
    fn store_executed<'a>(
        &'a self,
        entry: &'a SeedJournalEntry,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// All entries, oldest first.
    fn get_executed_seeds<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<SeedJournalEntry>>>;
}
