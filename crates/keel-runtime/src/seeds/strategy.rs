//! Strategy resolution and eligibility.
//!
//! A seed's strategy comes from the first resolver that recognises it, in
//! priority order, or from the configured fallback.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::error::Result;
use keel_core::journal::SeedJournal;
use keel_core::migration::{leaf_name, strip_known_extension};
use keel_core::script::Script;
use keel_core::seed::{Seed, SeedEligibility, SeedStrategy};

/// Maps a script and its source path to a strategy, if it recognises one.
pub type StrategyResolver = Arc<dyn Fn(&Script, Option<&Path>) -> Option<SeedStrategy> + Send + Sync>;

/// `always/users.sql`: the nearest enclosing folder named after a strategy.
pub fn folder_convention(script: &Script, path: Option<&Path>) -> Option<SeedStrategy> {
    let mut folders: Vec<&str> = script.name().split(['/', '\\']).collect();
    folders.pop();
    if let Some(strategy) = folders.iter().rev().find_map(|f| SeedStrategy::from_convention(f)) {
        return Some(strategy);
    }

    path?
        .parent()?
        .file_name()?
        .to_str()
        .and_then(SeedStrategy::from_convention)
}

/// `users.always.sql`: a strategy marker before the extension.
pub fn filename_convention(script: &Script, _path: Option<&Path>) -> Option<SeedStrategy> {
    let base = strip_known_extension(leaf_name(script.name()));
    let (_, marker) = base.rsplit_once('.')?;
    SeedStrategy::from_convention(marker)
}

/// Folder convention, then filename convention.
pub fn default_resolvers() -> Vec<StrategyResolver> {
    let folder: StrategyResolver = Arc::new(folder_convention);
    let filename: StrategyResolver = Arc::new(filename_convention);
    vec![folder, filename]
}

pub fn resolve_strategy(
    script: &Script,
    resolvers: &[StrategyResolver],
    fallback: SeedStrategy,
) -> SeedStrategy {
    resolvers
        .iter()
        .find_map(|resolve| resolve(script, script.path()))
        .unwrap_or(fallback)
}

/// Decide whether `seed` runs this pass.
pub async fn evaluate(
    seed: &Seed,
    journal: &dyn SeedJournal,
    cancel: &CancellationToken,
) -> Result<SeedEligibility> {
    let eligibility = match seed.strategy {
        SeedStrategy::RunAlways => SeedEligibility::run("runs on every pass"),
        SeedStrategy::RunOnce => {
            if journal.has_been_executed(&seed.name, cancel).await? {
                SeedEligibility::skip("already executed")
            } else {
                SeedEligibility::run("never executed")
            }
        }
        SeedStrategy::RunIfChanged => match journal.get_last_executed_hash(&seed.name, cancel).await? {
            None => SeedEligibility::run("never executed"),
            Some(hash) if hash == seed.hash() => {
                SeedEligibility::skip("content unchanged since last execution")
            }
            Some(_) => SeedEligibility::run("content changed since last execution"),
        },
    };
    Ok(eligibility)
}
