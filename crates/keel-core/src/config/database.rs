use serde::{Deserialize, Serialize};

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL of the target database.
    #[serde(default)]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,

    /// Statement timeout in seconds (0 disables it).
    #[serde(default)]
    pub statement_timeout_secs: u64,

    /// Schema holding the journal tables and receiving unqualified objects.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Database used to create the target database when it is missing.
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
            statement_timeout_secs: 0,
            schema: default_schema(),
            maintenance_database: default_maintenance_database(),
        }
    }
}

fn default_pool_size() -> u32 {
    5
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}
