mod pool;
mod provisioner;

pub use pool::PgConnectionManager;
pub use provisioner::PgDatabaseProvisioner;

use std::future::Future;

use keel_core::error::{KeelError, Result};
use tokio_util::sync::CancellationToken;

/// Quote a PostgreSQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Race `fut` against cancellation.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KeelError::Cancelled),
        result = fut => result,
    }
}
