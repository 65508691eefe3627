//! In-process journals.
//!
//! Useful for tests and dry runs. Entries live as long as the journal value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use keel_core::error::{KeelError, Result};
use keel_core::journal::{MigrationJournal, SeedJournal};
use keel_core::migration::{Migration, MigrationJournalEntry, MigrationResult};
use keel_core::seed::SeedJournalEntry;
use keel_core::BoxFuture;

#[derive(Default)]
struct MigrationRows {
    next_id: i64,
    entries: Vec<MigrationJournalEntry>,
}

/// Migration journal held in memory.
#[derive(Clone, Default)]
pub struct InMemoryMigrationJournal {
    rows: Arc<RwLock<MigrationRows>>,
    table_created: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryMigrationJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a journal error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn table_created(&self) -> bool {
        self.table_created.load(Ordering::SeqCst)
    }

    /// Snapshot of all entries, oldest first.
    pub async fn entries(&self) -> Vec<MigrationJournalEntry> {
        self.rows.read().await.entries.clone()
    }

    /// Migration names in journal order.
    pub async fn names(&self) -> Vec<String> {
        self.rows
            .read()
            .await
            .entries
            .iter()
            .map(|e| e.migration_name.clone())
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeelError::Journal("journal is not writable".into()));
        }
        Ok(())
    }
}

impl MigrationJournal for InMemoryMigrationJournal {
    fn ensure_table_exists<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.table_created.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn has_been_executed<'a>(
        &'a self,
        migration: &'a Migration,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows
                .entries
                .iter()
                .any(|e| e.upgrade_script_hash == migration.upgrade_hash()))
        })
    }

    fn store_executed<'a>(
        &'a self,
        migration: &'a Migration,
        downgrade_script: Option<&'a str>,
        result: &'a MigrationResult,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut rows = self.rows.write().await;
            if rows
                .entries
                .iter()
                .any(|e| e.upgrade_script_hash == migration.upgrade_hash())
            {
                return Err(KeelError::Journal(format!(
                    "duplicate upgrade script hash for '{}'",
                    migration.name
                )));
            }
            rows.next_id += 1;
            let id = rows.next_id;
            rows.entries.push(MigrationJournalEntry {
                id,
                upgrade_script_hash: migration.upgrade_hash().to_string(),
                migration_name: migration.name.clone(),
                downgrade_script: downgrade_script.map(str::to_string),
                migrated_on: Utc::now(),
                execution_time: result.duration,
            });
            Ok(())
        })
    }

    fn remove_executed<'a>(
        &'a self,
        upgrade_hash: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut rows = self.rows.write().await;
            rows.entries.retain(|e| e.upgrade_script_hash != upgrade_hash);
            Ok(())
        })
    }

    fn get_executed_migrations<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<MigrationJournalEntry>>> {
        Box::pin(async move { Ok(self.entries().await) })
    }
}

#[derive(Default)]
struct SeedRows {
    next_id: i64,
    entries: Vec<SeedJournalEntry>,
}

/// Seed journal held in memory.
#[derive(Clone, Default)]
pub struct InMemorySeedJournal {
    rows: Arc<RwLock<SeedRows>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemorySeedJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<SeedJournalEntry> {
        self.rows.read().await.entries.clone()
    }

    /// Number of recorded executions of `seed_name`.
    pub async fn execution_count(&self, seed_name: &str) -> usize {
        self.rows
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.seed_name == seed_name)
            .count()
    }
}

impl SeedJournal for InMemorySeedJournal {
    fn ensure_table_exists<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn has_been_executed<'a>(
        &'a self,
        seed_name: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.execution_count(seed_name).await > 0) })
    }

    fn get_last_executed_hash<'a>(
        &'a self,
        seed_name: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows
                .entries
                .iter()
                .rev()
                .find(|e| e.seed_name == seed_name)
                .map(|e| e.hash.clone()))
        })
    }

    fn store_executed<'a>(
        &'a self,
        entry: &'a SeedJournalEntry,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(KeelError::Journal("journal is not writable".into()));
            }
            let mut rows = self.rows.write().await;
            rows.next_id += 1;
            let mut entry = entry.clone();
            entry.id = rows.next_id;
            rows.entries.push(entry);
            Ok(())
        })
    }

    fn get_executed_seeds<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<SeedJournalEntry>>> {
        Box::pin(async move { Ok(self.entries().await) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_core::migration::Direction;
    use keel_core::script::Script;

    use super::*;

    fn migration(name: &str, text: &str) -> Migration {
        Migration::new(Script::from_text(name, text), None)
    }

    fn result_for(m: &Migration) -> MigrationResult {
        MigrationResult::succeeded(
            m.upgrade.clone(),
            &m.name,
            Direction::Upgrade,
            Duration::from_millis(2),
        )
    }

    #[tokio::test]
    async fn test_store_and_remove() {
        let cancel = CancellationToken::new();
        let journal = InMemoryMigrationJournal::new();
        let m = migration("001.sql", "CREATE TABLE a();");

        assert!(!journal.has_been_executed(&m, &cancel).await.unwrap());
        journal
            .store_executed(&m, Some("DROP TABLE a;"), &result_for(&m), &cancel)
            .await
            .unwrap();
        assert!(journal.has_been_executed(&m, &cancel).await.unwrap());

        let entries = journal.get_executed_migrations(&cancel).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[0].downgrade_script.as_deref(), Some("DROP TABLE a;"));

        journal.remove_executed(m.upgrade_hash(), &cancel).await.unwrap();
        assert!(journal.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let cancel = CancellationToken::new();
        let journal = InMemoryMigrationJournal::new();
        let a = migration("001.sql", "SELECT 1;");
        let b = migration("renamed.sql", "SELECT 1;");

        journal.store_executed(&a, None, &result_for(&a), &cancel).await.unwrap();
        let err = journal
            .store_executed(&b, None, &result_for(&b), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Journal(_)));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let cancel = CancellationToken::new();
        let journal = InMemoryMigrationJournal::new();
        journal.set_fail_writes(true);
        let m = migration("001.sql", "SELECT 1;");
        assert!(journal
            .store_executed(&m, None, &result_for(&m), &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_seed_last_hash_is_most_recent() {
        let cancel = CancellationToken::new();
        let journal = InMemorySeedJournal::new();
        for hash in ["h1", "h2"] {
            let entry = SeedJournalEntry {
                id: 0,
                seed_name: "users".into(),
                hash: hash.into(),
                strategy: "RunIfChanged".into(),
                executed_on: Utc::now(),
                duration: Duration::ZERO,
            };
            journal.store_executed(&entry, &cancel).await.unwrap();
        }

        assert!(journal.has_been_executed("users", &cancel).await.unwrap());
        assert!(!journal.has_been_executed("roles", &cancel).await.unwrap());
        assert_eq!(
            journal.get_last_executed_hash("users", &cancel).await.unwrap(),
            Some("h2".to_string())
        );
        let ids: Vec<_> = journal.entries().await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
