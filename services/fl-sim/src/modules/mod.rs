//! Simulated components, one tokio task each, exchanging encoded wire messages.
pub mod agent;
pub mod aggregator;
pub mod database;

pub use agent::AgentModule;
pub use aggregator::AggregatorModule;
pub use database::DatabaseModule;

/// Encoded message bytes, exactly as they would travel over a socket.
pub type Frame = Vec<u8>;
