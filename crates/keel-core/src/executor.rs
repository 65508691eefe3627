//! Script execution contract.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::ConnectionManager;
use crate::error::{KeelError, Result};
use crate::BoxFuture;

/// Fully prepared text handed to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableScript {
    /// Name used in logs and errors.
    pub name: String,
    pub text: String,
}

impl ExecutableScript {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Result of running one script.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<KeelError>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            error: None,
            duration,
        }
    }

    pub fn failed(error: KeelError, duration: Duration) -> Self {
        Self {
            success: false,
            error: Some(error),
            duration,
        }
    }

    /// Convert into a `Result`, keeping the duration on success.
    pub fn into_result(self) -> Result<Duration> {
        match self.error {
            Some(e) => Err(e),
            None if self.success => Ok(self.duration),
            None => Err(KeelError::Database("script execution failed".into())),
        }
    }
}

/// Runs prepared script text against the database.
pub trait ScriptExecutor: Send + Sync {
    /// Execute one script. Failures are reported in the outcome, not panicked.
    fn execute<'a>(
        &'a self,
        script: &'a ExecutableScript,
        connections: &'a dyn ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ExecutionOutcome>;

    /// Check that the target schema is usable, creating it if needed.
    fn verify_schema<'a>(
        &'a self,
        connections: &'a dyn ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;
}
