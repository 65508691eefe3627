use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::error::{KeelError, Result};
use keel_core::provider::ScriptProvider;
use keel_core::seed::{Seed, SeedStrategy};

use super::strategy::{default_resolvers, resolve_strategy, StrategyResolver};

/// Collects seeds from providers and assigns each a strategy.
#[derive(Clone)]
pub struct SeedDiscovery {
    providers: Vec<Arc<dyn ScriptProvider>>,
    resolvers: Vec<StrategyResolver>,
    fallback: SeedStrategy,
}

impl SeedDiscovery {
    pub fn new(providers: Vec<Arc<dyn ScriptProvider>>) -> Self {
        Self {
            providers,
            resolvers: default_resolvers(),
            fallback: SeedStrategy::default(),
        }
    }

    /// Replace the resolver chain.
    pub fn with_resolvers(mut self, resolvers: Vec<StrategyResolver>) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_fallback(mut self, fallback: SeedStrategy) -> Self {
        self.fallback = fallback;
        self
    }

    /// Seeds in case-insensitive name order.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<Seed>> {
        let mut seeds = Vec::new();
        for provider in &self.providers {
            for script in provider.get_scripts(cancel).await? {
                let strategy = resolve_strategy(&script, &self.resolvers, self.fallback);
                seeds.push(Seed::new(script, strategy));
            }
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for seed in &seeds {
            if let Some(existing) = seen.insert(seed.name.to_lowercase(), seed.script.name()) {
                return Err(KeelError::Config(format!(
                    "Seed name collision between '{}' and '{}'",
                    existing,
                    seed.script.name()
                )));
            }
        }

        seeds.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        debug!(count = seeds.len(), "Discovered seeds");
        Ok(seeds)
    }
}
