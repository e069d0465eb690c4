//! Hub facade
//!
//! Wires the registry, usage tracker, playground store, supervisor and chain
//! executor together and exposes the model and playground operations an
//! outer API layer calls.

use crate::chain::{ChainExecutor, RecoveryReport};
use crate::launcher::WorkerLauncher;
use crate::playground::{Playground, PlaygroundStore, PlaygroundUpdate};
use crate::registry::{JsonModelRegistry, ModelRegistry};
use crate::supervisor::{ProcessSupervisor, SupervisorSettings, WorkerState};
use crate::usage::{UsageMap, UsageTracker};
use modelplay_common::config::ModelPlayConfig;
use modelplay_common::error::Result;
use modelplay_common::METRICS;
use modelplay_proto::ModelInfo;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Hub {
    config: ModelPlayConfig,
    registry: Arc<JsonModelRegistry>,
    playgrounds: Arc<PlaygroundStore>,
    supervisor: Arc<ProcessSupervisor>,
    chains: ChainExecutor,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Open the persisted documents under the configured data directory
    pub fn open(config: ModelPlayConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        std::fs::create_dir_all(config.storage.models_path())?;

        let registry = Arc::new(JsonModelRegistry::open(config.storage.registry_path())?);
        let usage = Arc::new(UsageTracker::open(config.storage.usage_path())?);
        let playgrounds = Arc::new(PlaygroundStore::open(
            config.storage.playgrounds_path(),
            registry.clone(),
        )?);

        info!("Opened data directory {}", config.storage.data_dir.display());
        Ok(Self::assemble(config, registry, usage, playgrounds, launcher))
    }

    /// A hub that persists nothing
    pub fn in_memory(config: ModelPlayConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let registry = Arc::new(JsonModelRegistry::in_memory());
        let usage = Arc::new(UsageTracker::in_memory());
        let playgrounds = Arc::new(PlaygroundStore::in_memory(registry.clone()));
        Self::assemble(config, registry, usage, playgrounds, launcher)
    }

    fn assemble(
        config: ModelPlayConfig,
        registry: Arc<JsonModelRegistry>,
        usage: Arc<UsageTracker>,
        playgrounds: Arc<PlaygroundStore>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            usage,
            launcher,
            SupervisorSettings::from_config(&config),
        ));
        let chains = ChainExecutor::new(playgrounds.clone(), supervisor.clone());

        Self {
            config,
            registry,
            playgrounds,
            supervisor,
            chains,
        }
    }

    pub fn config(&self) -> &ModelPlayConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    // Models

    pub fn register_known(&self, entry: ModelInfo) -> Result<()> {
        self.registry.register_known(entry)
    }

    pub fn list_known(&self) -> Vec<ModelInfo> {
        self.registry.list_known()
    }

    pub fn list_downloaded(&self) -> Vec<ModelInfo> {
        self.registry.list_downloaded()
    }

    pub async fn download_model(&self, model_id: &str) -> Result<ModelInfo> {
        self.supervisor.download(model_id).await
    }

    pub async fn load_model(&self, model_id: &str) -> Result<()> {
        self.supervisor.load(model_id).await
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.supervisor.unload(model_id).await
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.supervisor.is_loaded(model_id)
    }

    pub fn model_status(&self, model_id: &str) -> Option<WorkerState> {
        self.supervisor.status(model_id)
    }

    pub fn loaded_models(&self) -> Vec<String> {
        self.supervisor.loaded_models()
    }

    pub async fn model_inference(&self, model_id: &str, data: Value) -> Result<Value> {
        self.supervisor.inference(model_id, data).await
    }

    pub async fn configure_model(&self, model_id: &str, config: Value) -> Result<Value> {
        self.supervisor.configure(model_id, config).await
    }

    pub fn usage(&self) -> UsageMap {
        self.supervisor.usage().snapshot()
    }

    // Playgrounds

    pub fn create_playground(&self, playground_id: Option<String>, description: &str) -> Result<Playground> {
        self.playgrounds.create(playground_id, description)
    }

    pub fn get_playground(&self, playground_id: &str) -> Result<Playground> {
        self.playgrounds.get(playground_id)
    }

    pub fn list_playgrounds(&self) -> Vec<Playground> {
        self.playgrounds.list()
    }

    pub async fn update_playground(&self, playground_id: &str, update: PlaygroundUpdate) -> Result<Playground> {
        let new_id = update.new_id.clone();
        let ids: Vec<&str> = std::iter::once(playground_id).chain(new_id.as_deref()).collect();
        self.chains
            .exclusive(&ids, || self.playgrounds.update(playground_id, update))
            .await
    }

    pub async fn delete_playground(&self, playground_id: &str) -> Result<()> {
        self.chains
            .exclusive(&[playground_id], || self.playgrounds.delete(playground_id))
            .await
    }

    pub async fn add_model(&self, playground_id: &str, model_id: &str) -> Result<Playground> {
        self.chains
            .exclusive(&[playground_id], || self.playgrounds.add_model(playground_id, model_id))
            .await
    }

    pub async fn remove_model(&self, playground_id: &str, model_id: &str) -> Result<Playground> {
        self.chains
            .exclusive(&[playground_id], || self.playgrounds.remove_model(playground_id, model_id))
            .await
    }

    pub async fn configure_chain(&self, playground_id: &str, chain: Vec<String>) -> Result<Vec<String>> {
        self.chains.configure_chain(playground_id, chain).await
    }

    pub async fn load_chain(&self, playground_id: &str) -> Result<Playground> {
        self.chains.load_playground_chain(playground_id).await
    }

    pub async fn stop_chain(&self, playground_id: &str) -> Result<Playground> {
        self.chains.stop_playground_chain(playground_id).await
    }

    pub async fn playground_inference(&self, playground_id: &str, data: Value) -> Result<Value> {
        self.chains.inference(playground_id, data).await
    }

    // Lifecycle

    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.chains.recover().await
    }

    pub fn start_health_checks(&self) -> JoinHandle<()> {
        self.supervisor.clone().start_health_checks()
    }

    /// Prometheus text exposition of all metrics
    pub fn metrics(&self) -> String {
        METRICS.gather()
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
