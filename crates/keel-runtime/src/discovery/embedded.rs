use tokio_util::sync::CancellationToken;

use keel_core::error::Result;
use keel_core::provider::{sort_scripts, ScriptProvider};
use keel_core::script::Script;
use keel_core::BoxFuture;

/// Scripts compiled into the binary, typically with `include_str!`.
///
/// Hashes cover the namespace and name as well as the text, so two packages
/// shipping an identical resource journal separately.
#[derive(Debug, Clone)]
pub struct EmbeddedScriptProvider {
    namespace: String,
    resources: Vec<(&'static str, &'static str)>,
}

impl EmbeddedScriptProvider {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resources: Vec::new(),
        }
    }

    /// Add a `(name, text)` resource.
    pub fn with_resource(mut self, name: &'static str, text: &'static str) -> Self {
        self.resources.push((name, text));
        self
    }

    pub fn with_resources(mut self, resources: &[(&'static str, &'static str)]) -> Self {
        self.resources.extend_from_slice(resources);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl ScriptProvider for EmbeddedScriptProvider {
    fn get_scripts<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async move {
            let mut scripts: Vec<Script> = self
                .resources
                .iter()
                .map(|(name, text)| Script::packaged(&self.namespace, *name, *text))
                .collect();
            sort_scripts(&mut scripts);
            Ok(scripts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedded_scripts_sorted() {
        let provider = EmbeddedScriptProvider::new("app")
            .with_resource("002_posts.sql", "CREATE TABLE posts();")
            .with_resources(&[("001_users.sql", "CREATE TABLE users();")]);

        let scripts = provider.get_scripts(&CancellationToken::new()).await.unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["001_users.sql", "002_posts.sql"]);
        assert!(scripts[0].path().is_none());
    }

    #[tokio::test]
    async fn test_namespace_changes_hash() {
        let cancel = CancellationToken::new();
        let a = EmbeddedScriptProvider::new("app").with_resource("001.sql", "SELECT 1;");
        let b = EmbeddedScriptProvider::new("billing").with_resource("001.sql", "SELECT 1;");

        let a = a.get_scripts(&cancel).await.unwrap();
        let b = b.get_scripts(&cancel).await.unwrap();
        assert_ne!(a[0].hash(), b[0].hash());
    }
}
