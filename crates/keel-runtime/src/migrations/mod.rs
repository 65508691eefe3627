//! Migration discovery, filtering, execution and orchestration.

mod builder;
mod execution;
mod filter;
mod orchestrator;

pub use builder::MigrationBuilder;
pub use execution::ScriptExecutionService;
pub use filter::{AppliedMigration, MigrationFilteringService, MigrationPlan};
pub use orchestrator::{
    MigrationOptions, MigrationOrchestrator, MigrationOrchestratorBuilder, MigrationPreview,
    MigrationStatus, OrchestratorState, UnresolvedVariables,
};
