//! KEEL migration engine.
//!
//! Discovers migration and seed scripts, decides what has to run against the
//! journal, and executes scripts one at a time:
//! - Script providers (filesystem, embedded, registered generators)
//! - Downgrade pairing by naming convention
//! - Migration filtering, execution and the upgrade/downgrade orchestrator
//! - Seed discovery, strategies and the seed orchestrator
//! - PostgreSQL journal, executor and provisioner backed by sqlx

pub mod db;
pub mod discovery;
pub mod executor;
pub mod journal;
pub mod migrations;
pub mod seeds;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use db::{PgConnectionManager, PgDatabaseProvisioner};
pub use discovery::{
    CodeScriptProvider, EmbeddedScriptProvider, FileSystemScriptProvider, NamingConventionResolver,
};
pub use executor::PgScriptExecutor;
pub use journal::{InMemoryMigrationJournal, InMemorySeedJournal, PgMigrationJournal, PgSeedJournal};
pub use migrations::{
    MigrationBuilder, MigrationFilteringService, MigrationOptions, MigrationOrchestrator,
    MigrationOrchestratorBuilder, MigrationPlan, MigrationPreview, MigrationStatus,
    OrchestratorState, ScriptExecutionService,
};
pub use seeds::{SeedDiscovery, SeedOptions, SeedOrchestrator, SeedOrchestratorBuilder};
