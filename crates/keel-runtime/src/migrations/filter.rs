use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::error::Result;
use keel_core::journal::MigrationJournal;
use keel_core::migration::{Migration, MigrationJournalEntry, MigrationOrdering};

use super::MigrationBuilder;

/// A discovered migration that the journal already records.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub migration: Migration,
    pub entry: MigrationJournalEntry,
}

/// Pending, applied and orphaned migrations from one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// In execution order.
    pub pending: Vec<Migration>,
    pub applied: Vec<AppliedMigration>,
    /// Journal entries with no discovered upgrade, most recent first.
    pub to_downgrade: Vec<MigrationJournalEntry>,
}

impl MigrationPlan {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.to_downgrade.is_empty()
    }
}

/// Compares discovered migrations with the journal.
///
/// Every call rediscovers scripts; nothing is cached between calls.
#[derive(Clone)]
pub struct MigrationFilteringService {
    builder: MigrationBuilder,
    journal: Arc<dyn MigrationJournal>,
    ordering: MigrationOrdering,
}

impl MigrationFilteringService {
    pub fn new(
        builder: MigrationBuilder,
        journal: Arc<dyn MigrationJournal>,
        ordering: MigrationOrdering,
    ) -> Self {
        Self {
            builder,
            journal,
            ordering,
        }
    }

    /// All discovered migrations in execution order.
    pub async fn migrations(&self, cancel: &CancellationToken) -> Result<Vec<Migration>> {
        let mut migrations = self.builder.build(cancel).await?;
        self.ordering.sort(&mut migrations);
        Ok(migrations)
    }

    pub async fn plan(&self, cancel: &CancellationToken) -> Result<MigrationPlan> {
        let migrations = self.migrations(cancel).await?;
        let entries = self.journal.get_executed_migrations(cancel).await?;
        Ok(partition(migrations, entries))
    }

    pub async fn pending(&self, cancel: &CancellationToken) -> Result<Vec<Migration>> {
        Ok(self.plan(cancel).await?.pending)
    }

    pub async fn applied(&self, cancel: &CancellationToken) -> Result<Vec<AppliedMigration>> {
        Ok(self.plan(cancel).await?.applied)
    }

    /// Orphaned journal entries, most recently executed first.
    pub async fn entries_to_downgrade(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<MigrationJournalEntry>> {
        Ok(self.plan(cancel).await?.to_downgrade)
    }

    pub async fn is_pending(&self, migration: &Migration, cancel: &CancellationToken) -> Result<bool> {
        Ok(!self.journal.has_been_executed(migration, cancel).await?)
    }
}

fn partition(migrations: Vec<Migration>, entries: Vec<MigrationJournalEntry>) -> MigrationPlan {
    let discovered: HashSet<&str> = migrations.iter().map(|m| m.upgrade_hash()).collect();
    let to_downgrade: Vec<MigrationJournalEntry> = entries
        .iter()
        .rev()
        .filter(|e| !discovered.contains(e.upgrade_script_hash.as_str()))
        .cloned()
        .collect();

    let mut plan = MigrationPlan {
        to_downgrade,
        ..Default::default()
    };
    for migration in migrations {
        match entries
            .iter()
            .find(|e| e.upgrade_script_hash == migration.upgrade_hash())
        {
            Some(entry) => plan.applied.push(AppliedMigration {
                migration,
                entry: entry.clone(),
            }),
            None => plan.pending.push(migration),
        }
    }
    plan
}
