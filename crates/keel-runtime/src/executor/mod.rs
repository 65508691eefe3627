mod batch;
mod postgres;

pub use batch::{contains_transaction_control, mask_sql, split_batches, Batch};
pub use postgres::PgScriptExecutor;
