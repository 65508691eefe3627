use std::path::PathBuf;

use thiserror::Error;

/// Core error type for KEEL operations.
#[derive(Error, Debug)]
pub enum KeelError {
    /// Missing collaborator or invalid setting, raised before any I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read script {path:?}: {source}")]
    ScriptDiscovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration '{migration}' failed: {source}")]
    MigrationExecution {
        migration: String,
        #[source]
        source: Box<KeelError>,
    },

    #[error("Seed '{seed}' failed: {source}")]
    SeedExecution {
        seed: String,
        #[source]
        source: Box<KeelError>,
    },

    #[error("Script '{0}' is empty after preparation")]
    EmptyScript(String),

    #[error("Script generation failed: {0}")]
    Generation(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Database connection error: {0}")]
    DatabaseConnection(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl KeelError {
    /// Wrap a failure of a single migration script.
    pub fn migration(name: impl Into<String>, source: KeelError) -> Self {
        KeelError::MigrationExecution {
            migration: name.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failure of a single seed script.
    pub fn seed(name: impl Into<String>, source: KeelError) -> Self {
        KeelError::SeedExecution {
            seed: name.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error (or the cause it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            KeelError::Cancelled => true,
            KeelError::MigrationExecution { source, .. } | KeelError::SeedExecution { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}

impl From<toml::de::Error> for KeelError {
    fn from(e: toml::de::Error) -> Self {
        KeelError::Config(format!("Failed to parse config: {}", e))
    }
}

/// Result type alias using KeelError.
pub type Result<T> = std::result::Result<T, KeelError>;
