use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use keel_core::database::{Connection, ConnectionManager, DatabaseProvisioner};
use keel_core::error::{KeelError, Result};
use keel_core::executor::{ExecutableScript, ExecutionOutcome, ScriptExecutor};
use keel_core::provider::{sort_scripts, ScriptProvider};
use keel_core::script::Script;
use keel_core::BoxFuture;

/// Provider backed by a mutable list of scripts.
#[derive(Clone, Default)]
pub struct StaticScriptProvider {
    scripts: Arc<RwLock<Vec<Script>>>,
}

impl StaticScriptProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding text scripts built from `(name, text)` pairs.
    pub fn with_scripts(scripts: &[(&str, &str)]) -> Self {
        let provider = Self::new();
        for (name, text) in scripts {
            provider.push(Script::from_text(*name, *text));
        }
        provider
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.write() {
            scripts.push(script);
        }
    }

    /// Replace the script with this name, or add it.
    pub fn set(&self, name: &str, text: &str) {
        self.remove(name);
        self.push(Script::from_text(name, text));
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut scripts) = self.scripts.write() {
            scripts.retain(|s| s.name() != name);
        }
    }
}

impl ScriptProvider for StaticScriptProvider {
    fn get_scripts<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async move {
            let mut scripts = self
                .scripts
                .read()
                .map(|s| s.clone())
                .map_err(|_| KeelError::Config("script list lock poisoned".into()))?;
            sort_scripts(&mut scripts);
            Ok(scripts)
        })
    }
}

#[derive(Default)]
struct ExecutorState {
    executed: Vec<ExecutableScript>,
    fail_names: HashSet<String>,
    fail_fragments: Vec<String>,
}

/// Executor that records scripts instead of running them.
#[derive(Clone, Default)]
pub struct MockScriptExecutor {
    state: Arc<RwLock<ExecutorState>>,
    schema_checks: Arc<AtomicUsize>,
    fail_schema: Arc<AtomicBool>,
}

impl MockScriptExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any script with this name.
    pub fn fail_on(&self, name: &str) {
        if let Ok(mut state) = self.state.write() {
            state.fail_names.insert(name.to_string());
        }
    }

    /// Fail any script whose text contains `fragment`.
    pub fn fail_when_contains(&self, fragment: &str) {
        if let Ok(mut state) = self.state.write() {
            state.fail_fragments.push(fragment.to_string());
        }
    }

    pub fn fail_schema_check(&self, fail: bool) {
        self.fail_schema.store(fail, Ordering::SeqCst);
    }

    /// Every script executed successfully or not, in call order.
    pub fn executed(&self) -> Vec<ExecutableScript> {
        self.state
            .read()
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    pub fn executed_names(&self) -> Vec<String> {
        self.executed().into_iter().map(|s| s.name).collect()
    }

    pub fn executed_texts(&self) -> Vec<String> {
        self.executed().into_iter().map(|s| s.text).collect()
    }

    pub fn schema_checks(&self) -> usize {
        self.schema_checks.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.write() {
            state.executed.clear();
        }
    }
}

impl ScriptExecutor for MockScriptExecutor {
    fn execute<'a>(
        &'a self,
        script: &'a ExecutableScript,
        _connections: &'a dyn ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ExecutionOutcome> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return ExecutionOutcome::failed(KeelError::Cancelled, Duration::ZERO);
            }
            let Ok(mut state) = self.state.write() else {
                return ExecutionOutcome::failed(
                    KeelError::Database("executor state poisoned".into()),
                    Duration::ZERO,
                );
            };
            state.executed.push(script.clone());

            let fails = state.fail_names.contains(&script.name)
                || state
                    .fail_fragments
                    .iter()
                    .any(|f| script.text.contains(f.as_str()));
            if fails {
                ExecutionOutcome::failed(
                    KeelError::Database(format!("simulated failure in '{}'", script.name)),
                    Duration::from_millis(1),
                )
            } else {
                ExecutionOutcome::succeeded(Duration::from_millis(1))
            }
        })
    }

    fn verify_schema<'a>(
        &'a self,
        _connections: &'a dyn ConnectionManager,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.schema_checks.fetch_add(1, Ordering::SeqCst);
            if self.fail_schema.load(Ordering::SeqCst) {
                return Err(KeelError::Database("schema unavailable".into()));
            }
            Ok(())
        })
    }
}

/// Connection manager for tests that never reach a database.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConnections;

impl ConnectionManager for NoConnections {
    fn create_connection<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async {
            Err(KeelError::DatabaseConnection(
                "no database available in tests".into(),
            ))
        })
    }
}

/// Provisioner with an in-memory existence flag.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    exists: Arc<AtomicBool>,
    created: Arc<AtomicUsize>,
    fail_create: Arc<AtomicBool>,
    template: Arc<RwLock<Option<String>>>,
}

impl MockProvisioner {
    pub fn new(exists: bool) -> Self {
        let provisioner = Self::default();
        provisioner.exists.store(exists, Ordering::SeqCst);
        provisioner
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Template passed to the last `create_database` call.
    pub fn last_template(&self) -> Option<String> {
        self.template.read().ok().and_then(|t| t.clone())
    }
}

impl DatabaseProvisioner for MockProvisioner {
    fn database_exists<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.exists()) })
    }

    fn create_database<'a>(
        &'a self,
        template: Option<&'a str>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(KeelError::Provisioning("permission denied to create database".into()));
            }
            if let Ok(mut last) = self.template.write() {
                *last = template.map(str::to_string);
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            self.exists.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_set_and_remove() {
        let cancel = CancellationToken::new();
        let provider = StaticScriptProvider::with_scripts(&[("002.sql", "b"), ("001.sql", "a")]);
        provider.set("001.sql", "a2");
        provider.remove("002.sql");

        let scripts = provider.get_scripts(&cancel).await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].text(), Some("a2"));
    }

    #[tokio::test]
    async fn test_mock_executor_records_and_fails() {
        let cancel = CancellationToken::new();
        let executor = MockScriptExecutor::new();
        executor.fail_on("bad");

        let ok = ExecutableScript::new("good", "SELECT 1");
        let bad = ExecutableScript::new("bad", "SELECT 2");
        assert!(executor.execute(&ok, &NoConnections, &cancel).await.success);
        assert!(!executor.execute(&bad, &NoConnections, &cancel).await.success);
        assert_eq!(executor.executed_names(), vec!["good", "bad"]);
    }

    #[tokio::test]
    async fn test_mock_provisioner_creates_once() {
        let cancel = CancellationToken::new();
        let provisioner = MockProvisioner::new(false);
        assert!(provisioner.ensure_database_exists(Some("tmpl"), &cancel).await.unwrap());
        assert!(!provisioner.ensure_database_exists(None, &cancel).await.unwrap());
        assert_eq!(provisioner.created_count(), 1);
        assert_eq!(provisioner.last_template().as_deref(), Some("tmpl"));
    }
}
