mod database;

pub use database::DatabaseConfig;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};
use crate::migration::MigrationOrdering;
use crate::provider::DowngradeMatchMode;
use crate::seed::SeedStrategy;
use crate::substitution::{substitute, Variables};

/// Root configuration for KEEL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration discovery and execution.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Seed discovery and execution.
    #[serde(default)]
    pub seeds: SeedsConfig,

    /// Values for `${name}` placeholders in scripts.
    #[serde(default)]
    pub variables: Variables,
}

impl KeelConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| KeelError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// `${VAR_NAME}` references to upper-case environment variables are
    /// replaced before parsing.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);
        let config: KeelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for the given database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.migrations.journal_table.trim().is_empty() {
            return Err(KeelError::Config("migrations.journal_table must not be empty".into()));
        }
        if self.seeds.journal_table.trim().is_empty() {
            return Err(KeelError::Config("seeds.journal_table must not be empty".into()));
        }
        if self.migrations.journal_table == self.seeds.journal_table {
            return Err(KeelError::Config(
                "migrations and seeds must use different journal tables".into(),
            ));
        }
        if self.migrations.downgrade_mode != DowngradeMatchMode::SameName
            && self.migrations.downgrade_pattern.is_empty()
        {
            return Err(KeelError::Config(
                "migrations.downgrade_pattern is required for suffix and prefix matching".into(),
            ));
        }
        if self.migrations.downgrade_mode == DowngradeMatchMode::SameName
            && self.migrations.downgrade_directory.is_none()
        {
            return Err(KeelError::Config(
                "migrations.downgrade_directory is required for same_name matching".into(),
            ));
        }
        Ok(())
    }
}

/// Migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding upgrade scripts.
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,

    /// Directory holding downgrade scripts (defaults to `directory`).
    #[serde(default)]
    pub downgrade_directory: Option<PathBuf>,

    /// How downgrade scripts are paired with upgrade scripts.
    #[serde(default)]
    pub downgrade_mode: DowngradeMatchMode,

    /// Marker used by suffix and prefix matching, e.g. `.down` or `down_`.
    #[serde(default = "default_downgrade_pattern")]
    pub downgrade_pattern: String,

    /// Execution order of pending migrations.
    #[serde(default)]
    pub ordering: MigrationOrdering,

    /// Whether orphaned journal entries are downgraded.
    #[serde(default)]
    pub downgrades_enabled: bool,

    /// Whether a missing database is created.
    #[serde(default)]
    pub auto_create_database: bool,

    /// Template database used when creating the database.
    #[serde(default)]
    pub database_template: Option<String>,

    /// Whether `${name}` placeholders are replaced.
    #[serde(default = "default_true")]
    pub substitution_enabled: bool,

    /// Journal table name.
    #[serde(default = "default_migrations_table")]
    pub journal_table: String,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            downgrade_directory: None,
            downgrade_mode: DowngradeMatchMode::default(),
            downgrade_pattern: default_downgrade_pattern(),
            ordering: MigrationOrdering::default(),
            downgrades_enabled: false,
            auto_create_database: false,
            database_template: None,
            substitution_enabled: true,
            journal_table: default_migrations_table(),
        }
    }
}

/// Seed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedsConfig {
    /// Whether seeds run at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding seed scripts.
    #[serde(default = "default_seeds_dir")]
    pub directory: PathBuf,

    /// Strategy for seeds no convention matches.
    #[serde(default)]
    pub fallback_strategy: SeedStrategy,

    /// Whether `${name}` placeholders are replaced.
    #[serde(default = "default_true")]
    pub substitution_enabled: bool,

    /// Seed journal table name.
    #[serde(default = "default_seeds_table")]
    pub journal_table: String,
}

impl Default for SeedsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_seeds_dir(),
            fallback_strategy: SeedStrategy::default(),
            substitution_enabled: true,
            journal_table: default_seeds_table(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_seeds_dir() -> PathBuf {
    PathBuf::from("seeds")
}

fn default_downgrade_pattern() -> String {
    ".down".to_string()
}

fn default_migrations_table() -> String {
    "keel_migrations".to_string()
}

fn default_seeds_table() -> String {
    "keel_seeds".to_string()
}

fn default_true() -> bool {
    true
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let env: Variables = std::env::vars()
        .filter(|(name, _)| {
            name.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        })
        .collect();

    substitute(content, &env).into_owned()
}
