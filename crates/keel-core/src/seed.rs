//! Seed scripts, strategies and seed journal records.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};
use crate::migration::strip_known_extension;
use crate::script::Script;

/// Policy deciding whether a seed runs on a given pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedStrategy {
    /// Run on every pass.
    RunAlways,
    /// Run once per seed name, whatever its content.
    #[default]
    RunOnce,
    /// Run when the content differs from the last recorded run.
    RunIfChanged,
}

impl SeedStrategy {
    /// Name stored in the seed journal.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunAlways => "RunAlways",
            Self::RunOnce => "RunOnce",
            Self::RunIfChanged => "RunIfChanged",
        }
    }

    /// Match a folder or filename marker such as `always` or `if-changed`.
    pub fn from_convention(token: &str) -> Option<Self> {
        let token: String = token
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match token.as_str() {
            "always" | "runalways" => Some(Self::RunAlways),
            "once" | "runonce" => Some(Self::RunOnce),
            "ifchanged" | "changed" | "runifchanged" => Some(Self::RunIfChanged),
            _ => None,
        }
    }
}

impl fmt::Display for SeedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedStrategy {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_convention(s)
            .ok_or_else(|| KeelError::Config(format!("Unknown seed strategy: {}", s)))
    }
}

/// A discovered seed with its resolved strategy.
#[derive(Debug, Clone)]
pub struct Seed {
    /// Script name with one known extension removed.
    pub name: String,
    pub script: Script,
    pub strategy: SeedStrategy,
}

impl Seed {
    pub fn new(script: Script, strategy: SeedStrategy) -> Self {
        Self {
            name: strip_known_extension(script.name()).to_string(),
            script,
            strategy,
        }
    }

    pub fn hash(&self) -> &str {
        self.script.hash()
    }
}

/// A row of the seed journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedJournalEntry {
    pub id: i64,
    pub seed_name: String,
    pub hash: String,
    pub strategy: String,
    pub executed_on: DateTime<Utc>,
    pub duration: Duration,
}

/// Whether a seed runs this pass, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedEligibility {
    pub eligible: bool,
    pub reason: String,
}

impl SeedEligibility {
    pub fn run(reason: impl Into<String>) -> Self {
        Self {
            eligible: true,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
        }
    }
}

/// Preview line for one seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPreview {
    pub seed_name: String,
    pub strategy: SeedStrategy,
    pub eligible: bool,
    pub reason: String,
}

/// Outcome of one seed execution attempt.
#[derive(Debug, Clone)]
pub struct SeedResult {
    pub seed_name: String,
    pub strategy: SeedStrategy,
    pub success: bool,
    pub error: Option<Arc<KeelError>>,
    pub message: Option<String>,
    pub duration: Duration,
}

impl SeedResult {
    pub fn succeeded(seed: &Seed, duration: Duration) -> Self {
        Self {
            seed_name: seed.name.clone(),
            strategy: seed.strategy,
            success: true,
            error: None,
            message: None,
            duration,
        }
    }

    pub fn failed(seed: &Seed, error: KeelError, duration: Duration) -> Self {
        Self {
            seed_name: seed.name.clone(),
            strategy: seed.strategy,
            success: false,
            message: Some(error.to_string()),
            error: Some(Arc::new(error)),
            duration,
        }
    }
}

/// Aggregate outcome of a seed run.
#[derive(Debug, Clone)]
pub struct SeedRunResult {
    pub success: bool,
    pub error: Option<Arc<KeelError>>,
    pub message: Option<String>,
    pub results: Vec<SeedResult>,
    /// Seeds whose strategy declined to run them.
    pub skipped: Vec<SeedPreview>,
}

impl Default for SeedRunResult {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            message: None,
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl SeedRunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: SeedResult) {
        if !result.success && self.success {
            self.success = false;
            self.error = result.error.clone();
            self.message = Some(format!(
                "seed '{}' failed: {}",
                result.seed_name,
                result.message.as_deref().unwrap_or("unknown error")
            ));
        }
        self.results.push(result);
    }

    pub fn fail(&mut self, error: KeelError) {
        self.success = false;
        self.message = Some(error.to_string());
        self.error = Some(Arc::new(error));
    }

    pub fn executed_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}
