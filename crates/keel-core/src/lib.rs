//! Core types and collaborator contracts for the KEEL migration engine.
//!
//! This crate holds the data model (scripts, migrations, seeds, journal
//! entries), the traits every collaborator implements, configuration, and
//! placeholder substitution. The engine itself lives in `keel-runtime`.

pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod journal;
pub mod migration;
pub mod provider;
pub mod script;
pub mod seed;
pub mod substitution;

use std::future::Future;
use std::pin::Pin;

pub use config::{DatabaseConfig, KeelConfig, MigrationsConfig, SeedsConfig};
pub use database::{Connection, ConnectionManager, DatabaseProvisioner};
pub use error::{KeelError, Result};
pub use executor::{ExecutableScript, ExecutionOutcome, ScriptExecutor};
pub use journal::{MigrationJournal, SeedJournal};
pub use migration::{
    Direction, Migration, MigrationJournalEntry, MigrationOrdering, MigrationResult,
    MigrationRunResult,
};
pub use provider::{DowngradeMatchMode, DowngradeResolver, NoDowngrades, ScriptProvider};
pub use script::{GeneratedScript, GeneratorContext, Script, ScriptContents, ScriptGenerator};
pub use seed::{
    Seed, SeedEligibility, SeedJournalEntry, SeedPreview, SeedResult, SeedRunResult, SeedStrategy,
};
pub use substitution::Variables;
pub use tokio_util::sync::CancellationToken;

/// Boxed future returned by the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
