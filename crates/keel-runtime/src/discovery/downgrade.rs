use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::error::Result;
use keel_core::migration::{leaf_name, strip_known_extension};
use keel_core::provider::{DowngradeMatchMode, DowngradeResolver, ScriptProvider};
use keel_core::script::Script;
use keel_core::BoxFuture;

/// Pairs upgrades with downgrade scripts by file name.
///
/// Only the final path component is compared, without its extension and
/// ignoring case. With [`DowngradeMatchMode::SameName`] the downgrade scripts
/// normally live in their own provider, such as a `down/` directory.
pub struct NamingConventionResolver {
    provider: Arc<dyn ScriptProvider>,
    mode: DowngradeMatchMode,
    pattern: String,
}

impl NamingConventionResolver {
    pub fn new(provider: Arc<dyn ScriptProvider>, mode: DowngradeMatchMode, pattern: impl Into<String>) -> Self {
        Self {
            provider,
            mode,
            pattern: pattern.into().to_lowercase(),
        }
    }

    /// `001_init.down.sql` style pairing.
    pub fn suffix(provider: Arc<dyn ScriptProvider>, pattern: impl Into<String>) -> Self {
        Self::new(provider, DowngradeMatchMode::Suffix, pattern)
    }

    /// `down_001_init.sql` style pairing.
    pub fn prefix(provider: Arc<dyn ScriptProvider>, pattern: impl Into<String>) -> Self {
        Self::new(provider, DowngradeMatchMode::Prefix, pattern)
    }

    /// Identical file names in a separate provider.
    pub fn same_name(provider: Arc<dyn ScriptProvider>) -> Self {
        Self::new(provider, DowngradeMatchMode::SameName, "")
    }

    pub fn mode(&self) -> DowngradeMatchMode {
        self.mode
    }

    fn base_of(name: &str) -> String {
        strip_known_extension(leaf_name(name)).to_lowercase()
    }

    /// Base name a downgrade for `upgrade` must carry.
    fn expected_base(&self, upgrade: &Script) -> String {
        let base = Self::base_of(upgrade.name());
        match self.mode {
            DowngradeMatchMode::SameName => base,
            DowngradeMatchMode::Suffix => format!("{}{}", base, self.pattern),
            DowngradeMatchMode::Prefix => format!("{}{}", self.pattern, base),
        }
    }

    fn is_downgrade_name(&self, name: &str) -> bool {
        let base = Self::base_of(name);
        match self.mode {
            DowngradeMatchMode::SameName => true,
            DowngradeMatchMode::Suffix => {
                base.len() > self.pattern.len() && base.ends_with(&self.pattern)
            }
            DowngradeMatchMode::Prefix => {
                base.len() > self.pattern.len() && base.starts_with(&self.pattern)
            }
        }
    }

    fn match_in(&self, upgrade: &Script, candidates: &[Script]) -> Option<Script> {
        let expected = self.expected_base(upgrade);
        candidates
            .iter()
            .filter(|candidate| !same_script(candidate, upgrade))
            .find(|candidate| Self::base_of(candidate.name()) == expected)
            .cloned()
    }
}

/// Identity used to tell a script from a copy discovered elsewhere.
pub(crate) fn same_script(a: &Script, b: &Script) -> bool {
    match (a.path(), b.path()) {
        (Some(x), Some(y)) => x == y,
        _ => a.name() == b.name() && a.hash() == b.hash(),
    }
}

impl DowngradeResolver for NamingConventionResolver {
    fn find_downgrade_for<'a>(
        &'a self,
        upgrade: &'a Script,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<Script>>> {
        Box::pin(async move {
            let candidates = self.get_downgrade_scripts(cancel).await?;
            Ok(self.match_in(upgrade, &candidates))
        })
    }

    fn get_downgrade_scripts<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async move {
            let scripts = self.provider.get_scripts(cancel).await?;
            Ok(scripts
                .into_iter()
                .filter(|s| self.is_downgrade_name(s.name()))
                .collect())
        })
    }

    fn find_downgrades_for<'a>(
        &'a self,
        upgrades: &'a [Script],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Option<Script>>>> {
        Box::pin(async move {
            let candidates = self.get_downgrade_scripts(cancel).await?;
            let found: Vec<_> = upgrades
                .iter()
                .map(|upgrade| self.match_in(upgrade, &candidates))
                .collect();
            debug!(
                upgrades = upgrades.len(),
                reversible = found.iter().filter(|d| d.is_some()).count(),
                "Resolved downgrade scripts"
            );
            Ok(found)
        })
    }
}
