//! Seed discovery, strategy evaluation and execution.

mod discovery;
mod orchestrator;
pub mod strategy;

pub use discovery::SeedDiscovery;
pub use orchestrator::{SeedOptions, SeedOrchestrator, SeedOrchestratorBuilder};
pub use strategy::StrategyResolver;
