use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keel_core::config::KeelConfig;
use keel_core::database::ConnectionManager;
use keel_core::error::{KeelError, Result};
use keel_core::executor::ScriptExecutor;
use keel_core::journal::SeedJournal;
use keel_core::provider::ScriptProvider;
use keel_core::seed::{Seed, SeedPreview, SeedRunResult, SeedStrategy};
use keel_core::substitution::Variables;

use super::strategy::{default_resolvers, evaluate, StrategyResolver};
use super::SeedDiscovery;
use crate::db::PgConnectionManager;
use crate::discovery::FileSystemScriptProvider;
use crate::executor::PgScriptExecutor;
use crate::journal::PgSeedJournal;
use crate::migrations::ScriptExecutionService;

/// Behaviour switches for a seed run.
#[derive(Debug, Clone)]
pub struct SeedOptions {
    pub enabled: bool,
    pub fallback_strategy: SeedStrategy,
    pub substitution_enabled: bool,
    pub variables: Variables,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_strategy: SeedStrategy::RunOnce,
            substitution_enabled: true,
            variables: Variables::new(),
        }
    }
}

impl From<&KeelConfig> for SeedOptions {
    fn from(config: &KeelConfig) -> Self {
        Self {
            enabled: config.seeds.enabled,
            fallback_strategy: config.seeds.fallback_strategy,
            substitution_enabled: config.seeds.substitution_enabled,
            variables: config.variables.clone(),
        }
    }
}

/// Builder for [`SeedOrchestrator`].
#[derive(Default)]
pub struct SeedOrchestratorBuilder {
    providers: Vec<Arc<dyn ScriptProvider>>,
    resolvers: Vec<StrategyResolver>,
    journal: Option<Arc<dyn SeedJournal>>,
    executor: Option<Arc<dyn ScriptExecutor>>,
    connections: Option<Arc<dyn ConnectionManager>>,
    options: SeedOptions,
}

impl SeedOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: Arc<dyn ScriptProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Add a resolver consulted before the folder and filename conventions.
    pub fn strategy_resolver(mut self, resolver: StrategyResolver) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn SeedJournal>) -> Self {
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

    pub fn options(mut self, options: SeedOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<SeedOrchestrator> {
        if self.providers.is_empty() {
            return Err(KeelError::Config("at least one seed provider is required".into()));
        }
        let journal = self
            .journal
            .ok_or_else(|| KeelError::Config("a seed journal is required".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| KeelError::Config("a script executor is required".into()))?;
        let connections = self
            .connections
            .ok_or_else(|| KeelError::Config("a connection manager is required".into()))?;

        let mut resolvers = self.resolvers;
        resolvers.extend(default_resolvers());
        let discovery = SeedDiscovery::new(self.providers)
            .with_resolvers(resolvers)
            .with_fallback(self.options.fallback_strategy);
        let execution = ScriptExecutionService::new(executor, connections)
            .with_variables(self.options.variables.clone())
            .with_substitution(self.options.substitution_enabled);

        Ok(SeedOrchestrator {
            discovery,
            execution,
            journal,
            options: self.options,
        })
    }
}

/// Runs eligible seeds one at a time.
pub struct SeedOrchestrator {
    discovery: SeedDiscovery,
    execution: ScriptExecutionService,
    journal: Arc<dyn SeedJournal>,
    options: SeedOptions,
}

impl SeedOrchestrator {
    pub fn builder() -> SeedOrchestratorBuilder {
        SeedOrchestratorBuilder::new()
    }

    /// PostgreSQL seed runner reading scripts from the configured directory.
    pub fn from_config(config: &KeelConfig) -> Result<Self> {
        let connections = PgConnectionManager::from_config(&config.database)?;
        Self::builder()
            .provider(Arc::new(FileSystemScriptProvider::new(&config.seeds.directory)))
            .journal(Arc::new(PgSeedJournal::new(&connections, &config.seeds.journal_table)))
            .executor(Arc::new(PgScriptExecutor::new(connections.schema())))
            .connections(Arc::new(connections))
            .options(SeedOptions::from(config))
            .build()
    }

    /// Discover seeds and run every eligible one, stopping at the first failure.
    pub async fn run(&self, cancel: &CancellationToken) -> SeedRunResult {
        let mut result = SeedRunResult::new();
        if !self.options.enabled {
            info!("Seeds disabled");
            return result;
        }

        if let Err(e) = self.journal.ensure_table_exists(cancel).await {
            result.fail(e);
            return result;
        }
        let seeds = match self.discovery.discover(cancel).await {
            Ok(seeds) => seeds,
            Err(e) => {
                result.fail(e);
                return result;
            }
        };

        for seed in &seeds {
            if cancel.is_cancelled() {
                result.fail(KeelError::Cancelled);
                break;
            }
            let preview = match self.preview_seed(seed, cancel).await {
                Ok(preview) => preview,
                Err(e) => {
                    result.fail(e);
                    break;
                }
            };
            if !preview.eligible {
                tracing::debug!(seed = %seed.name, reason = %preview.reason, "Skipping seed");
                result.skipped.push(preview);
                continue;
            }

            let outcome = self
                .execution
                .execute_seed(seed, self.journal.as_ref(), cancel)
                .await;
            let failed = !outcome.success;
            result.push(outcome);
            if failed {
                break;
            }
        }

        if result.success {
            info!(
                executed = result.executed_count(),
                skipped = result.skipped.len(),
                "Seed run complete"
            );
        } else {
            error!(
                message = result.message.as_deref().unwrap_or("unknown error"),
                "Seed run failed"
            );
        }
        result
    }

    async fn preview_seed(&self, seed: &Seed, cancel: &CancellationToken) -> Result<SeedPreview> {
        let eligibility = evaluate(seed, self.journal.as_ref(), cancel).await?;
        Ok(SeedPreview {
            seed_name: seed.name.clone(),
            strategy: seed.strategy,
            eligible: eligibility.eligible,
            reason: eligibility.reason,
        })
    }

    /// Eligibility and reason for every discovered seed. Nothing is executed.
    pub async fn preview(&self, cancel: &CancellationToken) -> Result<Vec<SeedPreview>> {
        let seeds = self.discovery.discover(cancel).await?;
        let mut previews = Vec::with_capacity(seeds.len());
        for seed in &seeds {
            previews.push(self.preview_seed(seed, cancel).await?);
        }
        Ok(previews)
    }
}
