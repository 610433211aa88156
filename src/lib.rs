// Core modules
pub mod bot;
pub mod clock;
pub mod config;
pub mod execution;
pub mod market;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod venue;

// Re-export commonly used types
pub use bot::{Bot, BotPhase};
pub use config::BotConfig;
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = anyhow::Result<T>;
