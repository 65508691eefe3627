use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::error::Result;
use keel_core::provider::{sort_scripts, ScriptProvider};
use keel_core::script::{Script, ScriptGenerator};
use keel_core::BoxFuture;

/// Explicit registry of code-generated scripts.
#[derive(Clone, Default)]
pub struct CodeScriptProvider {
    generators: Vec<(String, Arc<dyn ScriptGenerator>)>,
}

impl CodeScriptProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator under `name`, e.g. `004_backfill.rs`.
    pub fn register<G>(self, name: impl Into<String>, generator: G) -> Self
    where
        G: ScriptGenerator + 'static,
    {
        self.register_arc(name, Arc::new(generator))
    }

    pub fn register_arc(mut self, name: impl Into<String>, generator: Arc<dyn ScriptGenerator>) -> Self {
        self.generators.push((name.into(), generator));
        self
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

impl ScriptProvider for CodeScriptProvider {
    fn get_scripts<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async move {
            let mut scripts: Vec<Script> = self
                .generators
                .iter()
                .map(|(name, generator)| Script::generated(name.clone(), generator.clone()))
                .collect();
            sort_scripts(&mut scripts);
            Ok(scripts)
        })
    }
}
