//! Logging initialisation shared by the coordinator and worker binaries
//!
//! Everything goes to stderr: a worker's stdout is its IPC channel.

use crate::config::ObservabilityConfig;
use crate::error::{ModelPlayError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `config.log_level`.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.structured_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| ModelPlayError::internal(format!("Failed to install logger: {}", e)))
}
