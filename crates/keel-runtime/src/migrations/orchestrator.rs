//! Upgrade/downgrade state machine.

use std::path::{Component, Path};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_core::config::KeelConfig;
use keel_core::database::{ConnectionManager, DatabaseProvisioner};
use keel_core::error::{KeelError, Result};
use keel_core::executor::ScriptExecutor;
use keel_core::journal::MigrationJournal;
use keel_core::migration::{Migration, MigrationJournalEntry, MigrationOrdering, MigrationRunResult};
use keel_core::provider::{DowngradeResolver, NoDowngrades, ScriptProvider};
use keel_core::substitution::{unresolved_variables, Variables};

use super::{AppliedMigration, MigrationBuilder, MigrationFilteringService, ScriptExecutionService};
use crate::db::{PgConnectionManager, PgDatabaseProvisioner};
use crate::discovery::{FileSystemScriptProvider, NamingConventionResolver};
use crate::executor::PgScriptExecutor;
use crate::journal::PgMigrationJournal;

/// Behaviour switches for a migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub ordering: MigrationOrdering,
    pub downgrades_enabled: bool,
    pub auto_create_database: bool,
    pub database_template: Option<String>,
    pub substitution_enabled: bool,
    pub variables: Variables,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            ordering: MigrationOrdering::Ascending,
            downgrades_enabled: false,
            auto_create_database: false,
            database_template: None,
            substitution_enabled: true,
            variables: Variables::new(),
        }
    }
}

impl From<&KeelConfig> for MigrationOptions {
    fn from(config: &KeelConfig) -> Self {
        Self {
            ordering: config.migrations.ordering,
            downgrades_enabled: config.migrations.downgrades_enabled,
            auto_create_database: config.migrations.auto_create_database,
            database_template: config.migrations.database_template.clone(),
            substitution_enabled: config.migrations.substitution_enabled,
            variables: config.variables.clone(),
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    EnsureDatabase,
    EnsureJournalTable,
    ExecuteUpgrades,
    ExecuteDowngrades,
    Done,
    Failed,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::EnsureDatabase => "ensure_database",
            Self::EnsureJournalTable => "ensure_journal_table",
            Self::ExecuteUpgrades => "execute_upgrades",
            Self::ExecuteDowngrades => "execute_downgrades",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Placeholders a pending migration references without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedVariables {
    pub migration: String,
    pub names: Vec<String>,
}

/// What a run would do, computed without executing anything.
#[derive(Debug, Clone, Default)]
pub struct MigrationPreview {
    pub database_exists: bool,
    pub pending: Vec<Migration>,
    /// Only populated when downgrades are enabled.
    pub to_downgrade: Vec<MigrationJournalEntry>,
    pub unresolved_variables: Vec<UnresolvedVariables>,
}

/// Applied, pending and orphaned migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<Migration>,
    pub orphaned: Vec<MigrationJournalEntry>,
}

/// Builder for [`MigrationOrchestrator`].
#[derive(Default)]
pub struct MigrationOrchestratorBuilder {
    providers: Vec<Arc<dyn ScriptProvider>>,
    resolver: Option<Arc<dyn DowngradeResolver>>,
    journal: Option<Arc<dyn MigrationJournal>>,
    executor: Option<Arc<dyn ScriptExecutor>>,
    connections: Option<Arc<dyn ConnectionManager>>,
    provisioner: Option<Arc<dyn DatabaseProvisioner>>,
    options: MigrationOptions,
}

impl MigrationOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: Arc<dyn ScriptProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn downgrade_resolver(mut self, resolver: Arc<dyn DowngradeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn MigrationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ScriptExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn connections(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn DatabaseProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate collaborators. No I/O happens here.
    pub fn build(self) -> Result<MigrationOrchestrator> {
        if self.providers.is_empty() {
            return Err(KeelError::Config("at least one script provider is required".into()));
        }
        let journal = self
            .journal
            .ok_or_else(|| KeelError::Config("a migration journal is required".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| KeelError::Config("a script executor is required".into()))?;
        let connections = self
            .connections
            .ok_or_else(|| KeelError::Config("a connection manager is required".into()))?;
        if self.options.auto_create_database && self.provisioner.is_none() {
            return Err(KeelError::Config(
                "auto_create_database requires a database provisioner".into(),
            ));
        }

        let resolver = self.resolver.unwrap_or_else(|| Arc::new(NoDowngrades));
        let filter = MigrationFilteringService::new(
            MigrationBuilder::new(self.providers, resolver),
            journal.clone(),
            self.options.ordering,
        );
        let execution = ScriptExecutionService::new(executor, connections)
            .with_variables(self.options.variables.clone())
            .with_substitution(self.options.substitution_enabled);

        Ok(MigrationOrchestrator {
            filter,
            execution,
            journal,
            provisioner: self.provisioner,
            options: self.options,
            state: Arc::new(RwLock::new(OrchestratorState::Idle)),
        })
    }
}

/// Drives a migration run through its states, one script at a time.
pub struct MigrationOrchestrator {
    filter: MigrationFilteringService,
    execution: ScriptExecutionService,
    journal: Arc<dyn MigrationJournal>,
    provisioner: Option<Arc<dyn DatabaseProvisioner>>,
    options: MigrationOptions,
    state: Arc<RwLock<OrchestratorState>>,
}

impl MigrationOrchestrator {
    pub fn builder() -> MigrationOrchestratorBuilder {
        MigrationOrchestratorBuilder::new()
    }

    /// PostgreSQL orchestrator reading scripts from the configured directories.
    pub fn from_config(config: &KeelConfig) -> Result<Self> {
        let connections = PgConnectionManager::from_config(&config.database)?;
        let migrations = &config.migrations;

        let mut upgrades = FileSystemScriptProvider::new(&migrations.directory);
        if let Some(down) = &migrations.downgrade_directory {
            if let Some(nested) = nested_dir_name(&migrations.directory, down) {
                upgrades = upgrades.exclude_dir(nested);
            }
        }
        let downgrade_root = migrations
            .downgrade_directory
            .clone()
            .unwrap_or_else(|| migrations.directory.clone());
        let resolver = NamingConventionResolver::new(
            Arc::new(FileSystemScriptProvider::new(downgrade_root)),
            migrations.downgrade_mode,
            migrations.downgrade_pattern.clone(),
        );

        Self::builder()
            .provider(Arc::new(upgrades))
            .downgrade_resolver(Arc::new(resolver))
            .journal(Arc::new(PgMigrationJournal::new(
                &connections,
                &migrations.journal_table,
            )))
            .executor(Arc::new(PgScriptExecutor::new(connections.schema())))
            .provisioner(Arc::new(PgDatabaseProvisioner::from_config(&config.database)?))
            .connections(Arc::new(connections))
            .options(MigrationOptions::from(config))
            .build()
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// State reached by the current or most recent run.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    async fn enter(&self, state: OrchestratorState) {
        *self.state.write().await = state;
        tracing::debug!(state = state.as_str(), "Migration orchestrator state");
    }

    /// Run every phase to completion or first failure.
    pub async fn run(&self, cancel: &CancellationToken) -> MigrationRunResult {
        let mut result = MigrationRunResult::new();
        let mut state = OrchestratorState::Idle;

        loop {
            self.enter(state).await;
            if state.is_terminal() {
                break;
            }
            if cancel.is_cancelled() {
                result.fail(KeelError::Cancelled);
                state = OrchestratorState::Failed;
                continue;
            }

            state = match state {
                OrchestratorState::Idle => OrchestratorState::EnsureDatabase,
                OrchestratorState::EnsureDatabase => match self.ensure_database(cancel).await {
                    Ok(()) => OrchestratorState::EnsureJournalTable,
                    Err(e) => {
                        result.fail(e);
                        OrchestratorState::Failed
                    }
                },
                OrchestratorState::EnsureJournalTable => match self.ensure_journal(cancel).await {
                    Ok(()) => OrchestratorState::ExecuteUpgrades,
                    Err(e) => {
                        result.fail(e);
                        OrchestratorState::Failed
                    }
                },
                OrchestratorState::ExecuteUpgrades => {
                    self.execute_upgrades(&mut result, cancel).await;
                    if !result.success {
                        OrchestratorState::Failed
                    } else if self.options.downgrades_enabled {
                        OrchestratorState::ExecuteDowngrades
                    } else {
                        OrchestratorState::Done
                    }
                }
                OrchestratorState::ExecuteDowngrades => {
                    self.execute_downgrades(&mut result, cancel).await;
                    if result.success {
                        OrchestratorState::Done
                    } else {
                        OrchestratorState::Failed
                    }
                }
                OrchestratorState::Done | OrchestratorState::Failed => state,
            };
        }

        if result.success {
            info!(executed = result.results.len(), "Migration run complete");
        } else {
            error!(
                message = result.message.as_deref().unwrap_or("unknown error"),
                "Migration run failed"
            );
        }
        result
    }

    async fn ensure_database(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.options.auto_create_database {
            return Ok(());
        }
        let provisioner = self.provisioner.as_ref().ok_or_else(|| {
            KeelError::Config("auto_create_database requires a database provisioner".into())
        })?;
        let created = provisioner
            .ensure_database_exists(self.options.database_template.as_deref(), cancel)
            .await?;
        if created {
            info!("Created target database");
        }
        Ok(())
    }

    async fn ensure_journal(&self, cancel: &CancellationToken) -> Result<()> {
        self.execution
            .executor()
            .verify_schema(self.execution.connections(), cancel)
            .await?;
        self.journal.ensure_table_exists(cancel).await
    }

    async fn execute_upgrades(&self, result: &mut MigrationRunResult, cancel: &CancellationToken) {
        let pending = match self.filter.pending(cancel).await {
            Ok(pending) => pending,
            Err(e) => return result.fail(e),
        };
        if pending.is_empty() {
            info!("No pending migrations");
            return;
        }

        info!(count = pending.len(), "Applying pending migrations");
        for migration in &pending {
            if cancel.is_cancelled() {
                return result.fail(KeelError::Cancelled);
            }
            let outcome = self
                .execution
                .execute_upgrade(migration, self.journal.as_ref(), cancel)
                .await;
            let failed = !outcome.success;
            result.push(outcome);
            if failed {
                return;
            }
        }
    }

    async fn execute_downgrades(&self, result: &mut MigrationRunResult, cancel: &CancellationToken) {
        let orphaned = match self.filter.entries_to_downgrade(cancel).await {
            Ok(entries) => entries,
            Err(e) => return result.fail(e),
        };
        if orphaned.is_empty() {
            return;
        }

        info!(count = orphaned.len(), "Reverting orphaned migrations");
        for entry in &orphaned {
            if cancel.is_cancelled() {
                return result.fail(KeelError::Cancelled);
            }
            match self
                .execution
                .execute_downgrade(entry, self.journal.as_ref(), cancel)
                .await
            {
                Some(outcome) => {
                    let failed = !outcome.success;
                    result.push(outcome);
                    if failed {
                        return;
                    }
                }
                None => result.skipped_downgrades.push(entry.migration_name.clone()),
            }
        }
    }

    /// Compute what [`run`](Self::run) would do without executing scripts.
    ///
    /// The provisioner is only asked whether the database exists.
    pub async fn preview(&self, cancel: &CancellationToken) -> Result<MigrationPreview> {
        let database_exists = match &self.provisioner {
            Some(provisioner) => provisioner.database_exists(cancel).await?,
            None => true,
        };

        let (pending, to_downgrade) = if database_exists {
            let plan = self.filter.plan(cancel).await?;
            let to_downgrade = if self.options.downgrades_enabled {
                plan.to_downgrade
            } else {
                Vec::new()
            };
            (plan.pending, to_downgrade)
        } else if self.options.auto_create_database {
            (self.filter.migrations(cancel).await?, Vec::new())
        } else {
            warn!("Target database does not exist and auto-create is disabled, nothing to preview");
            return Ok(MigrationPreview {
                database_exists: false,
                ..Default::default()
            });
        };

        let unresolved = self.unresolved_in(&pending);
        Ok(MigrationPreview {
            database_exists,
            pending,
            to_downgrade,
            unresolved_variables: unresolved,
        })
    }

    fn unresolved_in(&self, pending: &[Migration]) -> Vec<UnresolvedVariables> {
        if !self.options.substitution_enabled {
            return Vec::new();
        }
        pending
            .iter()
            .filter_map(|m| {
                let names = unresolved_variables(m.upgrade.text()?, self.execution.variables());
                (!names.is_empty()).then(|| UnresolvedVariables {
                    migration: m.name.clone(),
                    names,
                })
            })
            .collect()
    }

    /// Applied, pending and orphaned migrations. Nothing is executed.
    pub async fn status(&self, cancel: &CancellationToken) -> Result<MigrationStatus> {
        let plan = self.filter.plan(cancel).await?;
        Ok(MigrationStatus {
            applied: plan.applied,
            pending: plan.pending,
            orphaned: plan.to_downgrade,
        })
    }
}

/// First path component of `nested` below `root`, if it lies inside it.
fn nested_dir_name(root: &Path, nested: &Path) -> Option<String> {
    match nested.strip_prefix(root).ok()?.components().next()? {
        Component::Normal(name) => name.to_str().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use keel_core::migration::Direction;
    use keel_core::script::{GeneratedScript, GeneratorContext, Script, ScriptGenerator};
    use keel_core::BoxFuture;

    use crate::journal::InMemoryMigrationJournal;
    use crate::testing::{MockProvisioner, MockScriptExecutor, NoConnections, StaticScriptProvider};

    struct Harness {
        provider: StaticScriptProvider,
        executor: MockScriptExecutor,
        journal: InMemoryMigrationJournal,
        provisioner: MockProvisioner,
    }

    impl Harness {
        fn new(scripts: &[(&str, &str)]) -> Self {
            Self {
                provider: StaticScriptProvider::with_scripts(scripts),
                executor: MockScriptExecutor::new(),
                journal: InMemoryMigrationJournal::new(),
                provisioner: MockProvisioner::new(true),
            }
        }

        fn builder(&self) -> MigrationOrchestratorBuilder {
            let provider: Arc<dyn ScriptProvider> = Arc::new(self.provider.clone());
            MigrationOrchestrator::builder()
                .provider(provider.clone())
                .downgrade_resolver(Arc::new(NamingConventionResolver::suffix(provider, ".down")))
                .journal(Arc::new(self.journal.clone()))
                .executor(Arc::new(self.executor.clone()))
                .connections(Arc::new(NoConnections))
                .provisioner(Arc::new(self.provisioner.clone()))
        }

        fn orchestrator(&self, options: MigrationOptions) -> MigrationOrchestrator {
            self.builder().options(options).build().unwrap()
        }
    }

    fn with_downgrades() -> MigrationOptions {
        MigrationOptions {
            downgrades_enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_database_applies_in_order() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[
            ("003_z.sql", "CREATE TABLE z();"),
            ("001_x.sql", "CREATE TABLE x();"),
            ("002_y.sql", "CREATE TABLE y();"),
        ]);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(result.results.len(), 3);
        assert_eq!(h.executor.executed_names(), vec!["001_x", "002_y", "003_z"]);
        assert_eq!(h.journal.names().await, vec!["001_x", "002_y", "003_z"]);
        assert!(h.journal.table_created());
        assert_eq!(h.executor.schema_checks(), 1);
        assert_eq!(orchestrator.state().await, OrchestratorState::Done);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "SELECT 1;"), ("002.sql", "SELECT 2;")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        assert!(orchestrator.run(&cancel).await.success);
        h.executor.clear();

        let second = orchestrator.run(&cancel).await;
        assert!(second.success);
        assert!(second.results.is_empty());
        assert!(h.executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_keeps_prior_results() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("A.sql", "SELECT 'a';"), ("B.sql", "SELECT 'b';"), ("C.sql", "SELECT 'c';")]);
        h.executor.fail_on("B");
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
        assert!(result.message.unwrap().contains("'B'"));
        assert_eq!(h.journal.names().await, vec!["A"]);
        assert_eq!(orchestrator.state().await, OrchestratorState::Failed);
    }

    #[tokio::test]
    async fn test_downgrade_symmetry() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[
            ("001_m.sql", "CREATE TABLE m();"),
            ("001_m.down.sql", "DROP TABLE m;"),
        ]);
        let orchestrator = h.orchestrator(with_downgrades());
        assert!(orchestrator.run(&cancel).await.success);

        h.provider.remove("001_m.sql");
        h.executor.clear();
        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(result.succeeded(Direction::Downgrade).count(), 1);
        assert_eq!(h.executor.executed_texts(), vec!["DROP TABLE m;"]);
        assert!(h.journal.entries().await.is_empty());

        h.executor.clear();
        let again = orchestrator.run(&cancel).await;
        assert!(again.success);
        assert!(again.results.is_empty());
        assert!(h.executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_replaced_by_new_migration() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[
            ("001.sql", "CREATE TABLE one();"),
            ("002.sql", "CREATE TABLE two();"),
            ("002.down.sql", "DROP TABLE two;"),
        ]);
        let orchestrator = h.orchestrator(with_downgrades());
        assert!(orchestrator.run(&cancel).await.success);
        assert_eq!(h.journal.names().await, vec!["001", "002"]);

        h.provider.remove("002.sql");
        h.provider.remove("002.down.sql");
        h.provider.set("003.sql", "CREATE TABLE three();");
        h.executor.clear();

        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(
            h.executor.executed_texts(),
            vec!["CREATE TABLE three();", "DROP TABLE two;"]
        );
        assert_eq!(h.journal.names().await, vec!["001", "003"]);
    }

    #[tokio::test]
    async fn test_orphan_without_downgrade_is_skipped() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "CREATE TABLE one();")]);
        let orchestrator = h.orchestrator(with_downgrades());
        assert!(orchestrator.run(&cancel).await.success);

        h.provider.remove("001.sql");
        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(result.skipped_downgrades, vec!["001"]);
        assert_eq!(h.journal.names().await, vec!["001"]);
    }

    #[tokio::test]
    async fn test_downgrades_disabled_leaves_orphans() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A"), ("001.down.sql", "undo A")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());
        assert!(orchestrator.run(&cancel).await.success);

        h.provider.remove("001.sql");
        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(h.journal.names().await, vec!["001"]);

        let status = orchestrator.status(&cancel).await.unwrap();
        assert_eq!(status.orphaned.len(), 1);
    }

    #[tokio::test]
    async fn test_edited_script_is_a_new_migration() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "SELECT 1;")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());
        assert!(orchestrator.run(&cancel).await.success);

        h.provider.set("001.sql", "SELECT 2;");
        let result = orchestrator.run(&cancel).await;
        assert!(result.success);
        assert_eq!(result.results.len(), 1);

        let entries = h.journal.entries().await;
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].upgrade_script_hash, entries[1].upgrade_script_hash);
    }

    #[tokio::test]
    async fn test_upgrade_failure_skips_downgrades() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A"), ("001.down.sql", "undo A")]);
        let orchestrator = h.orchestrator(with_downgrades());
        assert!(orchestrator.run(&cancel).await.success);

        h.provider.remove("001.sql");
        h.provider.set("002.sql", "broken");
        h.executor.fail_on("002");
        h.executor.clear();

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert_eq!(h.executor.executed_names(), vec!["002"]);
        assert_eq!(h.journal.names().await, vec!["001"]);
    }

    #[tokio::test]
    async fn test_journal_write_failure_fails_run() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A"), ("002.sql", "B")]);
        h.journal.set_fail_writes(true);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert_eq!(result.results.len(), 1);
        assert_eq!(h.executor.executed_names(), vec!["001"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let h = Harness::new(&[("001.sql", "A")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().is_cancelled());
        assert!(h.executor.executed().is_empty());
        assert!(!h.journal.table_created());
    }

    /// Cancels the shared token while running the named script.
    struct CancelDuring {
        inner: MockScriptExecutor,
        name: &'static str,
    }

    impl ScriptExecutor for CancelDuring {
        fn execute<'a>(
            &'a self,
            script: &'a keel_core::executor::ExecutableScript,
            connections: &'a dyn ConnectionManager,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, keel_core::executor::ExecutionOutcome> {
            Box::pin(async move {
                if script.name == self.name {
                    cancel.cancel();
                }
                self.inner.execute(script, connections, cancel).await
            })
        }

        fn verify_schema<'a>(
            &'a self,
            connections: &'a dyn ConnectionManager,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<()>> {
            self.inner.verify_schema(connections, cancel)
        }
    }

    #[tokio::test]
    async fn test_cancelled_between_migrations() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A"), ("002.sql", "B"), ("003.sql", "C")]);
        let orchestrator = h
            .builder()
            .executor(Arc::new(CancelDuring {
                inner: h.executor.clone(),
                name: "002",
            }))
            .build()
            .unwrap();

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().is_cancelled());
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
        assert_eq!(result.results[1].migration_name, "002");
        assert_eq!(h.executor.executed_names(), vec!["001"]);
        assert_eq!(h.journal.names().await, vec!["001"]);
        assert_eq!(orchestrator.state().await, OrchestratorState::Failed);
    }

    #[tokio::test]
    async fn test_unreadable_script_fails_run() {
        let cancel = CancellationToken::new();
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("001.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("002.sql"), [0xff, 0xfe, 0x00]).unwrap();
        let h = Harness::new(&[]);
        let orchestrator = MigrationOrchestrator::builder()
            .provider(Arc::new(FileSystemScriptProvider::new(dir.path())))
            .journal(Arc::new(h.journal.clone()))
            .executor(Arc::new(h.executor.clone()))
            .connections(Arc::new(NoConnections))
            .build()
            .unwrap();

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert!(matches!(
            result.error.as_deref(),
            Some(KeelError::ScriptDiscovery { .. })
        ));
        assert!(h.executor.executed().is_empty());
        assert!(h.journal.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_create_database_with_template() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A")]);
        let provisioner = MockProvisioner::new(false);
        let orchestrator = h
            .builder()
            .provisioner(Arc::new(provisioner.clone()))
            .options(MigrationOptions {
                auto_create_database: true,
                database_template: Some("template_app".into()),
                ..Default::default()
            })
            .build()
            .unwrap();

        assert!(orchestrator.run(&cancel).await.success);
        assert_eq!(provisioner.created_count(), 1);
        assert_eq!(provisioner.last_template().as_deref(), Some("template_app"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A")]);
        let provisioner = MockProvisioner::new(false);
        provisioner.fail_create(true);
        let orchestrator = h
            .builder()
            .provisioner(Arc::new(provisioner))
            .options(MigrationOptions {
                auto_create_database: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert!(matches!(result.error.as_deref(), Some(KeelError::Provisioning(_))));
        assert!(!h.journal.table_created());
    }

    #[tokio::test]
    async fn test_schema_check_failure_is_fatal() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A")]);
        h.executor.fail_schema_check(true);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let result = orchestrator.run(&cancel).await;
        assert!(!result.success);
        assert!(!h.journal.table_created());
        assert!(h.executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_preview_does_not_execute() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "CREATE SCHEMA ${schema};"), ("002.sql", "B")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());

        let preview = orchestrator.preview(&cancel).await.unwrap();
        assert!(preview.database_exists);
        assert_eq!(preview.pending.len(), 2);
        assert_eq!(
            preview.unresolved_variables,
            vec![UnresolvedVariables {
                migration: "001".into(),
                names: vec!["schema".into()],
            }]
        );
        assert!(h.executor.executed().is_empty());
        assert!(h.journal.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_preview_missing_database_without_auto_create() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A")]);
        let orchestrator = h
            .builder()
            .provisioner(Arc::new(MockProvisioner::new(false)))
            .build()
            .unwrap();

        let preview = orchestrator.preview(&cancel).await.unwrap();
        assert!(!preview.database_exists);
        assert!(preview.pending.is_empty());
    }

    #[tokio::test]
    async fn test_preview_missing_database_with_auto_create() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A"), ("002.sql", "B")]);
        let provisioner = MockProvisioner::new(false);
        let orchestrator = h
            .builder()
            .provisioner(Arc::new(provisioner.clone()))
            .options(MigrationOptions {
                auto_create_database: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let preview = orchestrator.preview(&cancel).await.unwrap();
        assert!(!preview.database_exists);
        assert_eq!(preview.pending.len(), 2);
        assert_eq!(provisioner.created_count(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_applied_with_entries() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[("001.sql", "A")]);
        let orchestrator = h.orchestrator(MigrationOptions::default());
        assert!(orchestrator.run(&cancel).await.success);
        h.provider.set("002.sql", "B");

        let status = orchestrator.status(&cancel).await.unwrap();
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.applied[0].entry.migration_name, "001");
        assert_eq!(status.pending[0].name, "002");
        assert!(status.orphaned.is_empty());
    }

    struct Counter;

    impl ScriptGenerator for Counter {
        fn fingerprint(&self) -> String {
            "v1".into()
        }

        fn supports_downgrade(&self) -> bool {
            true
        }

        fn generate<'a>(&'a self, _ctx: &'a GeneratorContext<'a>) -> BoxFuture<'a, Result<GeneratedScript>> {
            Box::pin(async {
                Ok(GeneratedScript::new("CREATE TABLE counters();").with_downgrade("DROP TABLE counters;"))
            })
        }
    }

    #[tokio::test]
    async fn test_generated_migration_round_trip() {
        let cancel = CancellationToken::new();
        let h = Harness::new(&[]);
        h.provider.push(Script::generated("001_counters.rs", Arc::new(Counter)));
        let orchestrator = h.orchestrator(with_downgrades());

        assert!(orchestrator.run(&cancel).await.success);
        assert_eq!(h.executor.executed_texts(), vec!["CREATE TABLE counters();"]);

        h.provider.remove("001_counters.rs");
        assert!(orchestrator.run(&cancel).await.success);
        assert_eq!(h.executor.executed_texts().last().unwrap(), "DROP TABLE counters;");
        assert!(h.journal.entries().await.is_empty());
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = MigrationOrchestrator::builder().build().err().unwrap();
        assert!(matches!(err, KeelError::Config(_)));

        let h = Harness::new(&[]);
        let err = MigrationOrchestrator::builder()
            .provider(Arc::new(h.provider.clone()))
            .executor(Arc::new(h.executor.clone()))
            .connections(Arc::new(NoConnections))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, KeelError::Config(msg) if msg.contains("journal")));
    }

    #[test]
    fn test_auto_create_requires_provisioner() {
        let h = Harness::new(&[]);
        let err = MigrationOrchestrator::builder()
            .provider(Arc::new(h.provider.clone()))
            .journal(Arc::new(h.journal.clone()))
            .executor(Arc::new(h.executor.clone()))
            .connections(Arc::new(NoConnections))
            .options(MigrationOptions {
                auto_create_database: true,
                ..Default::default()
            })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, KeelError::Config(_)));
    }

    #[test]
    fn test_nested_dir_name() {
        assert_eq!(
            nested_dir_name(Path::new("migrations"), Path::new("migrations/down")),
            Some("down".to_string())
        );
        assert_eq!(nested_dir_name(Path::new("migrations"), &PathBuf::from("rollback")), None);
    }

    #[test]
    fn test_options_from_config() {
        let config = KeelConfig::parse_toml(
            r#"
            [migrations]
            downgrades_enabled = true
            ordering = "descending"

            [variables]
            schema = "app"
            "#,
        )
        .unwrap();
        let options = MigrationOptions::from(&config);
        assert!(options.downgrades_enabled);
        assert_eq!(options.ordering, MigrationOrdering::Descending);
        assert_eq!(options.variables.get("schema").map(String::as_str), Some("app"));
    }
}
