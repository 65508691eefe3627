//! Script discovery contracts.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::script::Script;
use crate::BoxFuture;

/// A source of named scripts.
///
/// Implementations return scripts sorted case-insensitively by name and treat
/// a missing source as empty. Failing to read a discovered script fails the
/// whole call.
pub trait ScriptProvider: Send + Sync {
    fn get_scripts<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Script>>>;
}

/// Maps an upgrade script to its reverse script.
pub trait DowngradeResolver: Send + Sync {
    /// The reverse script for `upgrade`, if one exists.
    fn find_downgrade_for<'a>(
        &'a self,
        upgrade: &'a Script,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<Script>>>;

    /// Every script this resolver considers a downgrade script.
    fn get_downgrade_scripts<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Script>>>;

    /// Resolve several upgrades at once, in input order.
    fn find_downgrades_for<'a>(
        &'a self,
        upgrades: &'a [Script],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Option<Script>>>> {
        Box::pin(async move {
            let mut found = Vec::with_capacity(upgrades.len());
            for upgrade in upgrades {
                found.push(self.find_downgrade_for(upgrade, cancel).await?);
            }
            Ok(found)
        })
    }
}

/// Naming convention pairing a downgrade script with its upgrade script.
///
/// Names are compared case-insensitively on their final path component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeMatchMode {
    /// Same base name, usually in a separate directory.
    SameName,
    /// `<base><pattern><ext>`, e.g. `001_init.down.sql`.
    #[default]
    Suffix,
    /// `<pattern><base><ext>`, e.g. `down_001_init.sql`.
    Prefix,
}

/// Resolver for hosts that ship no reverse scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDowngrades;

impl DowngradeResolver for NoDowngrades {
    fn find_downgrade_for<'a>(
        &'a self,
        _upgrade: &'a Script,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<Script>>> {
        Box::pin(async { Ok(None) })
    }

    fn get_downgrade_scripts<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Script>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Sort scripts the way every provider returns them.
pub fn sort_scripts(scripts: &mut [Script]) {
    scripts.sort_by(|a, b| {
        a.name()
            .to_lowercase()
            .cmp(&b.name().to_lowercase())
            .then_with(|| a.name().cmp(b.name()))
    });
}
