//! Migration records, journal entries and execution results.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KeelError;
use crate::script::Script;

/// Extensions stripped from a script name to form the migration name.
pub const KNOWN_EXTENSIONS: &[&str] = &[".sql", ".rs"];

/// Strip exactly one known extension, compared case-insensitively.
pub fn strip_known_extension(name: &str) -> &str {
    for ext in KNOWN_EXTENSIONS {
        if name.len() > ext.len() {
            let split = name.len() - ext.len();
            if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(ext) {
                return &name[..split];
            }
        }
    }
    name
}

/// Key used for ordering: leading separators trimmed, lowercased.
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches(|c: char| {
        matches!(c, '/' | '\\' | '.' | '_' | '-') || c.is_whitespace()
    })
    .to_lowercase()
}

/// The final path component of a script or migration name.
pub fn leaf_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Order in which pending migrations are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOrdering {
    #[default]
    Ascending,
    Descending,
}

impl MigrationOrdering {
    /// Compare two migration names under this policy.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        let ord = normalize_name(a)
            .cmp(&normalize_name(b))
            .then_with(|| a.cmp(b));
        match self {
            Self::Ascending => ord,
            Self::Descending => ord.reverse(),
        }
    }

    /// Sort migrations in place.
    pub fn sort(&self, migrations: &mut [Migration]) {
        migrations.sort_by(|a, b| self.compare(&a.name, &b.name));
    }
}

/// An upgrade script paired with its optional reverse script.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Script name with one known extension removed.
    pub name: String,
    pub upgrade: Script,
    pub downgrade: Option<Script>,
}

impl Migration {
    /// Build a migration; the name is derived from the upgrade script.
    pub fn new(upgrade: Script, downgrade: Option<Script>) -> Self {
        Self {
            name: strip_known_extension(upgrade.name()).to_string(),
            upgrade,
            downgrade,
        }
    }

    pub fn has_downgrade(&self) -> bool {
        self.downgrade.is_some()
    }

    /// Journal identity of this migration.
    pub fn upgrade_hash(&self) -> &str {
        self.upgrade.hash()
    }
}

/// A row of the migration journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJournalEntry {
    pub id: i64,
    /// Unique identity of the executed upgrade script.
    pub upgrade_script_hash: String,
    pub migration_name: String,
    /// Reverse script text captured when the upgrade ran.
    pub downgrade_script: Option<String>,
    pub migrated_on: DateTime<Utc>,
    pub execution_time: Duration,
}

/// Direction of a single script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upgrade,
    Downgrade,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
        }
    }
}

/// Outcome of one script execution attempt.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub script: Script,
    pub migration_name: String,
    pub direction: Direction,
    pub success: bool,
    pub error: Option<Arc<KeelError>>,
    pub message: Option<String>,
    pub duration: Duration,
}

impl MigrationResult {
    pub fn succeeded(
        script: Script,
        migration_name: impl Into<String>,
        direction: Direction,
        duration: Duration,
    ) -> Self {
        Self {
            script,
            migration_name: migration_name.into(),
            direction,
            success: true,
            error: None,
            message: None,
            duration,
        }
    }

    pub fn failed(
        script: Script,
        migration_name: impl Into<String>,
        direction: Direction,
        error: KeelError,
        duration: Duration,
    ) -> Self {
        Self {
            script,
            migration_name: migration_name.into(),
            direction,
            success: false,
            message: Some(error.to_string()),
            error: Some(Arc::new(error)),
            duration,
        }
    }
}

/// Aggregate outcome of an orchestrator run.
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    pub success: bool,
    pub error: Option<Arc<KeelError>>,
    pub message: Option<String>,
    /// Every attempt in execution order, including the failing one.
    pub results: Vec<MigrationResult>,
    /// Orphaned migrations left in place because no downgrade text was recorded.
    pub skipped_downgrades: Vec<String>,
}

impl Default for MigrationRunResult {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            message: None,
            results: Vec::new(),
            skipped_downgrades: Vec::new(),
        }
    }
}

impl MigrationRunResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt. A failed attempt fails the whole run.
    pub fn push(&mut self, result: MigrationResult) {
        if !result.success && self.success {
            self.success = false;
            self.error = result.error.clone();
            self.message = Some(match &result.message {
                Some(msg) => format!(
                    "{} of '{}' failed: {}",
                    result.direction.as_str(),
                    result.migration_name,
                    msg
                ),
                None => format!(
                    "{} of '{}' failed",
                    result.direction.as_str(),
                    result.migration_name
                ),
            });
        }
        self.results.push(result);
    }

    /// Fail the run with an error not tied to one script.
    pub fn fail(&mut self, error: KeelError) {
        self.success = false;
        self.message = Some(error.to_string());
        self.error = Some(Arc::new(error));
    }

    /// Successful attempts in the given direction.
    pub fn succeeded(&self, direction: Direction) -> impl Iterator<Item = &MigrationResult> {
        self.results
            .iter()
            .filter(move |r| r.success && r.direction == direction)
    }
}
