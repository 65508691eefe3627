//! Test doubles for the engine's collaborators.
//!
//! Everything here runs without a database: connections are never handed
//! out, executors record what they were asked to run.

mod mock;

pub use mock::{MockProvisioner, MockScriptExecutor, NoConnections, StaticScriptProvider};
