//! ModelPlay common library
//!
//! This crate contains shared code used across ModelPlay components.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::ModelPlayConfig;
pub use error::{ModelPlayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
