//! ModelPlay Coordinator - Main Entry Point
//!
//! Opens the data directory, restores active playground chains and keeps
//! the worker processes healthy until interrupted.

use modelplay_common::{ModelPlayConfig, Result};
use modelplay_coordinator::{Hub, ProcessLauncher};
use modelplay_proto::{Modality, ModelInfo, TEXT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Resolve a bare worker binary name against the directory of this executable
fn worker_binary(configured: &Path) -> PathBuf {
    if configured.components().count() == 1 {
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(configured)))
            .filter(|path| path.exists())
        {
            return sibling;
        }
    }
    configured.to_path_buf()
}

/// Make the bundled reference models downloadable on a fresh install
fn seed_catalogue(hub: &Hub) -> Result<()> {
    if !hub.list_known().is_empty() {
        return Ok(());
    }

    let models_dir = hub.config().storage.models_path();
    for (model_id, class, output) in [
        ("echo", "echo", TEXT),
        ("uppercase", "uppercase", TEXT),
        ("pixel-sink", "pixel-sink", "image"),
    ] {
        hub.register_known(ModelInfo {
            model_id: model_id.to_string(),
            construction_class: class.to_string(),
            storage_dir: models_dir.join(model_id),
            modality: Modality::new(TEXT, output),
            config: serde_json::json!({}),
        })?;
    }
    info!("Seeded model catalogue with reference models");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("MODELPLAY_CONFIG")
        .unwrap_or_else(|_| "configs/modelplay.yaml".to_string());
    let config = ModelPlayConfig::load(&config_path)?;

    modelplay_common::logging::init_logging(&config.observability)?;
    info!("Starting ModelPlay Coordinator");
    info!(
        "Configuration loaded from {}: data_dir={}, device={}",
        config_path,
        config.storage.data_dir.display(),
        config.supervisor.device
    );

    let launcher = Arc::new(ProcessLauncher::new(worker_binary(
        &config.supervisor.worker_binary,
    )));
    let hub = Hub::open(config, launcher)?;
    seed_catalogue(&hub)?;

    match hub.recover().await {
        Ok(report) => info!(
            "Recovery finished: {} chains restored, {} deactivated",
            report.restored.len(),
            report.deactivated.len()
        ),
        Err(e) => error!("Recovery failed: {}", e),
    }

    // Start health check task
    let health_check_handle = hub.start_health_checks();

    info!("ModelPlay Coordinator running");

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = health_check_handle => {
            if let Err(e) = result {
                warn!("Health check task ended: {}", e);
            }
        }
    }

    hub.shutdown().await;
    if hub.config().observability.enable_metrics {
        info!("Final metrics:\n{}", hub.metrics());
    }

    info!("ModelPlay Coordinator shutdown complete");
    Ok(())
}
