use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::error::{KeelError, Result};
use keel_core::migration::{strip_known_extension, Migration};
use keel_core::provider::{DowngradeResolver, NoDowngrades, ScriptProvider};
use keel_core::script::Script;

use crate::discovery::same_script;

/// Turns provider output into migration records.
#[derive(Clone)]
pub struct MigrationBuilder {
    providers: Vec<Arc<dyn ScriptProvider>>,
    resolver: Arc<dyn DowngradeResolver>,
}

impl MigrationBuilder {
    pub fn new(providers: Vec<Arc<dyn ScriptProvider>>, resolver: Arc<dyn DowngradeResolver>) -> Self {
        Self { providers, resolver }
    }

    /// Builder for irreversible migrations.
    pub fn without_downgrades(providers: Vec<Arc<dyn ScriptProvider>>) -> Self {
        Self::new(providers, Arc::new(NoDowngrades))
    }

    /// Discover scripts and pair each upgrade with its downgrade.
    ///
    /// The result is sorted by raw script name. Two upgrades whose base names
    /// differ only by case or extension are rejected.
    pub async fn build(&self, cancel: &CancellationToken) -> Result<Vec<Migration>> {
        let mut scripts = Vec::new();
        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(KeelError::Cancelled);
            }
            scripts.extend(provider.get_scripts(cancel).await?);
        }

        let downgrades = self.resolver.get_downgrade_scripts(cancel).await?;
        let mut upgrades: Vec<Script> = scripts
            .into_iter()
            .filter(|s| !downgrades.iter().any(|d| same_script(d, s)))
            .collect();
        upgrades.sort_by(|a, b| a.name().cmp(b.name()));

        check_collisions(&upgrades)?;

        let resolved = self.resolver.find_downgrades_for(&upgrades, cancel).await?;
        let migrations: Vec<Migration> = upgrades
            .into_iter()
            .zip(resolved)
            .map(|(upgrade, downgrade)| Migration::new(upgrade, downgrade))
            .collect();

        debug!(count = migrations.len(), "Built migrations");
        Ok(migrations)
    }
}

fn check_collisions(upgrades: &[Script]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for script in upgrades {
        let key = strip_known_extension(script.name()).to_lowercase();
        if let Some(existing) = seen.insert(key, script.name()) {
            return Err(KeelError::Config(format!(
                "Migration name collision between '{}' and '{}'",
                existing,
                script.name()
            )));
        }
    }
    Ok(())
}
