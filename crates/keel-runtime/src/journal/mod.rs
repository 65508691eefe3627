mod memory;
mod postgres;

pub use memory::{InMemoryMigrationJournal, InMemorySeedJournal};
pub use postgres::{PgMigrationJournal, PgSeedJournal};
