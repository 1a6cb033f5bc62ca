// Core modules
pub mod api;
pub mod engine;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use engine::{StepOutput, TradeEngine};
pub use models::*;
pub use risk::{RiskConfig, RiskState};
pub use strategy::StrategyConfig;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
