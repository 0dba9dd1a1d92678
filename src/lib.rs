// Core modules
pub mod analytics;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod portfolio;
pub mod reconcile;
pub mod recovery;
pub mod risk;

// Re-export commonly used types
pub use api::{GatewayError, MarketGateway};
pub use error::{Error, Outcome, Refusal};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
