use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::database::ConnectionManager;
use keel_core::error::{KeelError, Result};
use keel_core::executor::{ExecutableScript, ScriptExecutor};
use keel_core::journal::{MigrationJournal, SeedJournal};
use keel_core::migration::{Direction, Migration, MigrationJournalEntry, MigrationResult};
use keel_core::script::{GeneratedScript, GeneratorContext, Script, ScriptContents};
use keel_core::seed::{Seed, SeedJournalEntry, SeedResult};
use keel_core::substitution::{substitute, Variables};

/// Turns scripts into executable text and runs them one at a time.
#[derive(Clone)]
pub struct ScriptExecutionService {
    executor: Arc<dyn ScriptExecutor>,
    connections: Arc<dyn ConnectionManager>,
    variables: Arc<Variables>,
    substitution_enabled: bool,
}

impl ScriptExecutionService {
    pub fn new(executor: Arc<dyn ScriptExecutor>, connections: Arc<dyn ConnectionManager>) -> Self {
        Self {
            executor,
            connections,
            variables: Arc::new(Variables::new()),
            substitution_enabled: true,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_substitution(mut self, enabled: bool) -> Self {
        self.substitution_enabled = enabled;
        self
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn executor(&self) -> &dyn ScriptExecutor {
        self.executor.as_ref()
    }

    pub fn connections(&self) -> &dyn ConnectionManager {
        self.connections.as_ref()
    }

    fn substitute_text(&self, text: &str) -> String {
        if self.substitution_enabled {
            substitute(text, &self.variables).into_owned()
        } else {
            text.to_string()
        }
    }

    /// Produce the text a script runs with.
    ///
    /// Generated scripts are rendered by their generator and carry their own
    /// downgrade when the generator supports one. Static text is substituted.
    pub async fn render(&self, script: &Script, cancel: &CancellationToken) -> Result<GeneratedScript> {
        match script.contents() {
            ScriptContents::Static(text) => Ok(GeneratedScript::new(self.substitute_text(text))),
            ScriptContents::Generated(generator) => {
                let ctx = GeneratorContext {
                    connections: self.connections.as_ref(),
                    variables: &self.variables,
                    cancel,
                };
                let mut generated = generator.generate(&ctx).await?;
                if !generator.supports_downgrade() {
                    generated.downgrade = None;
                }
                Ok(generated)
            }
        }
    }

    /// Upgrade text plus the downgrade text to snapshot into the journal.
    async fn prepare_migration(
        &self,
        migration: &Migration,
        cancel: &CancellationToken,
    ) -> Result<GeneratedScript> {
        let mut prepared = self.render(&migration.upgrade, cancel).await?;
        if prepared.upgrade.trim().is_empty() {
            return Err(KeelError::EmptyScript(migration.name.clone()));
        }
        if prepared.downgrade.is_none() {
            if let Some(downgrade) = &migration.downgrade {
                prepared.downgrade = Some(self.render(downgrade, cancel).await?.upgrade);
            }
        }
        Ok(prepared)
    }

    async fn run(&self, name: &str, text: String, cancel: &CancellationToken) -> Result<Duration> {
        let script = ExecutableScript::new(name, text);
        self.executor
            .execute(&script, self.connections.as_ref(), cancel)
            .await
            .into_result()
    }

    /// Execute a migration's upgrade and journal it on success.
    ///
    /// Nothing is journaled when preparation or execution fails. Once the
    /// script has run, the journal write ignores `cancel`.
    pub async fn execute_upgrade(
        &self,
        migration: &Migration,
        journal: &dyn MigrationJournal,
        cancel: &CancellationToken,
    ) -> MigrationResult {
        let start = Instant::now();
        let failed = |e: KeelError, duration: Duration| {
            MigrationResult::failed(
                migration.upgrade.clone(),
                &migration.name,
                Direction::Upgrade,
                KeelError::migration(&migration.name, e),
                duration,
            )
        };

        let prepared = match self.prepare_migration(migration, cancel).await {
            Ok(prepared) => prepared,
            Err(e) => return failed(e, start.elapsed()),
        };

        debug!(migration = %migration.name, "Applying migration");
        let duration = match self.run(&migration.name, prepared.upgrade, cancel).await {
            Ok(duration) => duration,
            Err(e) => return failed(e, start.elapsed()),
        };

        let result = MigrationResult::succeeded(
            migration.upgrade.clone(),
            &migration.name,
            Direction::Upgrade,
            duration,
        );
        if let Err(e) = journal
            .store_executed(migration, prepared.downgrade.as_deref(), &result, &committed())
            .await
        {
            return failed(e, duration);
        }

        info!(migration = %migration.name, ?duration, "Migration applied");
        result
    }

    /// Run the downgrade text snapshotted in `entry` and drop the entry.
    ///
    /// Returns `None` when the entry has no downgrade text to run.
    pub async fn execute_downgrade(
        &self,
        entry: &MigrationJournalEntry,
        journal: &dyn MigrationJournal,
        cancel: &CancellationToken,
    ) -> Option<MigrationResult> {
        let Some(text) = entry.downgrade_script.as_deref() else {
            warn!(
                migration = %entry.migration_name,
                "Orphaned migration has no downgrade script, leaving it in the journal"
            );
            return None;
        };

        let start = Instant::now();
        let script = Script::from_text(entry.migration_name.clone(), text);
        let failed = |e: KeelError, duration: Duration| {
            MigrationResult::failed(
                script.clone(),
                &entry.migration_name,
                Direction::Downgrade,
                KeelError::migration(&entry.migration_name, e),
                duration,
            )
        };

        let prepared = self.substitute_text(text);
        if prepared.trim().is_empty() {
            return Some(failed(
                KeelError::EmptyScript(entry.migration_name.clone()),
                start.elapsed(),
            ));
        }

        debug!(migration = %entry.migration_name, "Reverting migration");
        let duration = match self.run(&entry.migration_name, prepared, cancel).await {
            Ok(duration) => duration,
            Err(e) => return Some(failed(e, start.elapsed())),
        };

        if let Err(e) = journal
            .remove_executed(&entry.upgrade_script_hash, &committed())
            .await
        {
            return Some(failed(e, duration));
        }

        info!(migration = %entry.migration_name, ?duration, "Migration reverted");
        Some(MigrationResult::succeeded(
            script.clone(),
            &entry.migration_name,
            Direction::Downgrade,
            duration,
        ))
    }

    /// Execute a seed and append a journal entry on success.
    pub async fn execute_seed(
        &self,
        seed: &Seed,
        journal: &dyn SeedJournal,
        cancel: &CancellationToken,
    ) -> SeedResult {
        let start = Instant::now();
        let failed = |e: KeelError, duration: Duration| {
            SeedResult::failed(seed, KeelError::seed(&seed.name, e), duration)
        };

        let text = match self.render(&seed.script, cancel).await {
            Ok(rendered) => rendered.upgrade,
            Err(e) => return failed(e, start.elapsed()),
        };
        if text.trim().is_empty() {
            return failed(KeelError::EmptyScript(seed.name.clone()), start.elapsed());
        }

        debug!(seed = %seed.name, strategy = %seed.strategy, "Running seed");
        let duration = match self.run(&seed.name, text, cancel).await {
            Ok(duration) => duration,
            Err(e) => return failed(e, start.elapsed()),
        };

        let entry = SeedJournalEntry {
            id: 0,
            seed_name: seed.name.clone(),
            hash: seed.hash().to_string(),
            strategy: seed.strategy.as_str().to_string(),
            executed_on: Utc::now(),
            duration,
        };
        if let Err(e) = journal.store_executed(&entry, &committed()).await {
            return failed(e, duration);
        }

        info!(seed = %seed.name, ?duration, "Seed executed");
        SeedResult::succeeded(seed, duration)
    }
}

/// Token for journal writes that follow a successful execution.
fn committed() -> CancellationToken {
    CancellationToken::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::script::ScriptGenerator;
    use keel_core::seed::SeedStrategy;
    use keel_core::BoxFuture;

    use crate::db::cancellable;
    use crate::journal::{InMemoryMigrationJournal, InMemorySeedJournal};
    use crate::testing::{MockScriptExecutor, NoConnections};

    fn service(executor: &MockScriptExecutor) -> ScriptExecutionService {
        ScriptExecutionService::new(Arc::new(executor.clone()), Arc::new(NoConnections))
            .with_variables(Variables::from([("schema".to_string(), "app".to_string())]))
    }

    struct Reversible;

    impl ScriptGenerator for Reversible {
        fn supports_downgrade(&self) -> bool {
            true
        }

        fn generate<'a>(&'a self, ctx: &'a GeneratorContext<'a>) -> BoxFuture<'a, Result<GeneratedScript>> {
            Box::pin(async move {
                let schema = ctx.variables.get("schema").cloned().unwrap_or_default();
                Ok(GeneratedScript::new(format!("CREATE TABLE {}.gen();", schema))
                    .with_downgrade(format!("DROP TABLE {}.gen;", schema)))
            })
        }
    }

    #[tokio::test]
    async fn test_upgrade_substitutes_and_snapshots_downgrade() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(
            Script::from_text("001.sql", "CREATE TABLE ${schema}.a();"),
            Some(Script::from_text("001.down.sql", "DROP TABLE ${schema}.a;")),
        );

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(result.success);
        assert_eq!(executor.executed_texts(), vec!["CREATE TABLE app.a();"]);

        let entries = journal.entries().await;
        assert_eq!(entries[0].downgrade_script.as_deref(), Some("DROP TABLE app.a;"));
        assert_eq!(entries[0].upgrade_script_hash, migration.upgrade_hash());
    }

    #[tokio::test]
    async fn test_substitution_disabled() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(Script::from_text("001.sql", "SELECT '${schema}';"), None);

        service(&executor)
            .with_substitution(false)
            .execute_upgrade(&migration, &journal, &cancel)
            .await;
        assert_eq!(executor.executed_texts(), vec!["SELECT '${schema}';"]);
    }

    #[tokio::test]
    async fn test_empty_script_never_reaches_executor() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(Script::from_text("004_blank.sql", "  \n\t"), None);

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("004_blank"));
        assert!(executor.executed().is_empty());
        assert!(journal.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_comment_only_script_is_executed_and_journaled() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(
            Script::from_text("006_placeholder.sql", "-- intentionally empty\n"),
            None,
        );

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(result.success);
        assert_eq!(executor.executed_names(), vec!["006_placeholder"]);
        assert_eq!(journal.names().await, vec!["006_placeholder"]);
    }

    #[tokio::test]
    async fn test_failed_upgrade_not_journaled() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        executor.fail_on("001");
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(Script::from_text("001.sql", "SELECT 1;"), None);

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(!result.success);
        assert!(matches!(
            result.error.as_deref(),
            Some(KeelError::MigrationExecution { migration, .. }) if migration == "001"
        ));
        assert!(journal.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_journal_failure_fails_result() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        journal.set_fail_writes(true);
        let migration = Migration::new(Script::from_text("001.sql", "SELECT 1;"), None);

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(!result.success);
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_generated_script_with_downgrade() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let migration = Migration::new(Script::generated("005_gen.rs", Arc::new(Reversible)), None);
        assert_eq!(migration.name, "005_gen");

        let result = service(&executor).execute_upgrade(&migration, &journal, &cancel).await;
        assert!(result.success);
        assert_eq!(executor.executed_texts(), vec!["CREATE TABLE app.gen();"]);
        assert_eq!(
            journal.entries().await[0].downgrade_script.as_deref(),
            Some("DROP TABLE app.gen;")
        );
    }

    #[tokio::test]
    async fn test_downgrade_removes_entry() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let svc = service(&executor);
        let migration = Migration::new(
            Script::from_text("001.sql", "CREATE TABLE a();"),
            Some(Script::from_text("001.down.sql", "DROP TABLE a;")),
        );
        svc.execute_upgrade(&migration, &journal, &cancel).await;
        let entry = journal.entries().await.remove(0);

        let result = svc.execute_downgrade(&entry, &journal, &cancel).await.unwrap();
        assert!(result.success);
        assert_eq!(result.direction, Direction::Downgrade);
        assert!(journal.entries().await.is_empty());
        assert_eq!(executor.executed_texts().last().unwrap(), "DROP TABLE a;");
    }

    #[tokio::test]
    async fn test_failed_downgrade_keeps_entry() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let svc = service(&executor);
        let migration = Migration::new(
            Script::from_text("001.sql", "CREATE TABLE a();"),
            Some(Script::from_text("001.down.sql", "DROP TABLE a;")),
        );
        svc.execute_upgrade(&migration, &journal, &cancel).await;
        executor.fail_when_contains("DROP");
        let entry = journal.entries().await.remove(0);

        let result = svc.execute_downgrade(&entry, &journal, &cancel).await.unwrap();
        assert!(!result.success);
        assert_eq!(journal.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_without_text_is_skipped() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemoryMigrationJournal::new();
        let svc = service(&executor);
        let migration = Migration::new(Script::from_text("001.sql", "CREATE TABLE a();"), None);
        svc.execute_upgrade(&migration, &journal, &cancel).await;
        let entry = journal.entries().await.remove(0);

        assert!(svc.execute_downgrade(&entry, &journal, &cancel).await.is_none());
        assert_eq!(journal.entries().await.len(), 1);
    }

    /// Cancels the run right after the inner executor succeeds.
    struct CancelAfterRun(MockScriptExecutor);

    impl ScriptExecutor for CancelAfterRun {
        fn execute<'a>(
            &'a self,
            script: &'a ExecutableScript,
            connections: &'a dyn ConnectionManager,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, keel_core::executor::ExecutionOutcome> {
            Box::pin(async move {
                let outcome = self.0.execute(script, connections, cancel).await;
                cancel.cancel();
                outcome
            })
        }

        fn verify_schema<'a>(
            &'a self,
            connections: &'a dyn ConnectionManager,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<()>> {
            self.0.verify_schema(connections, cancel)
        }
    }

    /// Journal whose writes give up as soon as their token is cancelled.
    struct CancellableJournal(InMemoryMigrationJournal);

    impl MigrationJournal for CancellableJournal {
        fn ensure_table_exists<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
            self.0.ensure_table_exists(cancel)
        }

        fn has_been_executed<'a>(
            &'a self,
            migration: &'a Migration,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<bool>> {
            self.0.has_been_executed(migration, cancel)
        }

        fn store_executed<'a>(
            &'a self,
            migration: &'a Migration,
            downgrade_script: Option<&'a str>,
            result: &'a MigrationResult,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(cancellable(
                cancel,
                self.0.store_executed(migration, downgrade_script, result, cancel),
            ))
        }

        fn remove_executed<'a>(
            &'a self,
            upgrade_hash: &'a str,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(cancellable(cancel, self.0.remove_executed(upgrade_hash, cancel)))
        }

        fn get_executed_migrations<'a>(
            &'a self,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<Vec<MigrationJournalEntry>>> {
            self.0.get_executed_migrations(cancel)
        }
    }

    #[tokio::test]
    async fn test_cancel_after_commit_still_journals_upgrade() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let inner = InMemoryMigrationJournal::new();
        let journal = CancellableJournal(inner.clone());
        let svc = ScriptExecutionService::new(
            Arc::new(CancelAfterRun(executor.clone())),
            Arc::new(NoConnections),
        );
        let migration = Migration::new(
            Script::from_text("001.sql", "CREATE TABLE a();"),
            Some(Script::from_text("001.down.sql", "DROP TABLE a;")),
        );

        let result = svc.execute_upgrade(&migration, &journal, &cancel).await;
        assert!(cancel.is_cancelled());
        assert!(result.success);
        assert_eq!(executor.executed().len(), 1);
        assert_eq!(inner.names().await, vec!["001"]);
    }

    #[tokio::test]
    async fn test_cancel_after_commit_still_removes_downgraded_entry() {
        let executor = MockScriptExecutor::new();
        let inner = InMemoryMigrationJournal::new();
        let journal = CancellableJournal(inner.clone());
        let migration = Migration::new(
            Script::from_text("001.sql", "CREATE TABLE a();"),
            Some(Script::from_text("001.down.sql", "DROP TABLE a;")),
        );
        service(&executor)
            .execute_upgrade(&migration, &journal, &CancellationToken::new())
            .await;
        let entry = inner.entries().await.remove(0);

        let cancel = CancellationToken::new();
        let svc = ScriptExecutionService::new(
            Arc::new(CancelAfterRun(executor.clone())),
            Arc::new(NoConnections),
        );
        let result = svc.execute_downgrade(&entry, &journal, &cancel).await.unwrap();
        assert!(result.success);
        assert!(inner.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_seed_journaled_with_strategy() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        let journal = InMemorySeedJournal::new();
        let seed = Seed::new(
            Script::from_text("users.sql", "INSERT INTO ${schema}.users VALUES (1);"),
            SeedStrategy::RunIfChanged,
        );

        let result = service(&executor).execute_seed(&seed, &journal, &cancel).await;
        assert!(result.success);
        let entries = journal.entries().await;
        assert_eq!(entries[0].strategy, "RunIfChanged");
        assert_eq!(entries[0].hash, seed.hash());
        assert_eq!(executor.executed_texts(), vec!["INSERT INTO app.users VALUES (1);"]);
    }
}
