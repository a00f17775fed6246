// Core modules
pub mod api;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod indicators;
pub mod market;
pub mod models;
pub mod sentiment;

// Re-export commonly used types
pub use config::EngineConfig;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
