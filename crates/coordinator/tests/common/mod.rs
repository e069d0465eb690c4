//! Shared fixtures: a launcher that hosts workers as tokio tasks instead of
//! OS processes, plus helpers to assemble a supervisor or a hub around it.

#![allow(dead_code)]

use async_trait::async_trait;
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_common::ModelPlayConfig;
use modelplay_coordinator::{
    Hub, JsonModelRegistry, ModelRegistry, ProcessSupervisor, SupervisorSettings, UsageTracker,
    WorkerChannel, WorkerLauncher, WorkerProcess,
};
use modelplay_proto::{LaunchSpec, Modality, ModelInfo};
use modelplay_worker::{run_download, run_worker, Model, ModelFactory};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::{AbortHandle, JoinHandle};

/// Fails to load
struct BrokenModel;

impl Model for BrokenModel {
    fn load(&mut self, _device: &str, _metadata: &ModelInfo) -> Result<()> {
        Err(ModelPlayError::model("weights missing"))
    }

    fn inference(&mut self, _data: &Value) -> Result<Value> {
        unreachable!("never loaded")
    }
}

/// Blocks its worker for `sleep_ms` per request, then echoes
struct SleepyModel {
    sleep: Duration,
}

impl Model for SleepyModel {
    fn load(&mut self, _device: &str, _metadata: &ModelInfo) -> Result<()> {
        Ok(())
    }

    fn inference(&mut self, data: &Value) -> Result<Value> {
        std::thread::sleep(self.sleep);
        Ok(data.clone())
    }
}

struct PanickyModel;

impl Model for PanickyModel {
    fn load(&mut self, _device: &str, _metadata: &ModelInfo) -> Result<()> {
        Ok(())
    }

    fn inference(&mut self, _data: &Value) -> Result<Value> {
        panic!("tensor shape mismatch")
    }
}

/// Built-in classes plus `broken`, `sleepy` and `panicky`
pub fn test_factory() -> ModelFactory {
    let mut factory = ModelFactory::with_builtin();
    factory.register("broken", |_| Ok(Box::new(BrokenModel)));
    factory.register("sleepy", |info| {
        let ms = info.config.get("sleep_ms").and_then(Value::as_u64).unwrap_or(1000);
        Ok(Box::new(SleepyModel {
            sleep: Duration::from_millis(ms),
        }))
    });
    factory.register("panicky", |_| Ok(Box::new(PanickyModel)));
    factory
}

struct TaskProcess {
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
        Ok(())
    }
}

/// Runs each worker as a tokio task over an in-memory duplex pipe
pub struct InProcessLauncher {
    factory: ModelFactory,
    launches: Mutex<HashMap<String, usize>>,
    tasks: Mutex<HashMap<String, AbortHandle>>,
    failing_spawns: AtomicUsize,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::with_factory(test_factory())
    }

    pub fn with_factory(factory: ModelFactory) -> Self {
        Self {
            factory,
            launches: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            failing_spawns: AtomicUsize::new(0),
        }
    }

    /// Successful serving launches for `model_id`
    pub fn launches(&self, model_id: &str) -> usize {
        self.launches.lock().get(model_id).copied().unwrap_or(0)
    }

    /// Make the next `n` launches fail before a worker starts
    pub fn fail_next_spawns(&self, n: usize) {
        self.failing_spawns.store(n, Ordering::SeqCst);
    }

    /// Kill the latest worker of `model_id` without telling the supervisor
    pub fn crash(&self, model_id: &str) -> bool {
        match self.tasks.lock().get(model_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn start(&self, spec: &LaunchSpec, download: bool) -> Result<WorkerChannel> {
        let pending = self.failing_spawns.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_spawns.store(pending - 1, Ordering::SeqCst);
            return Err(ModelPlayError::transport("simulated spawn failure"));
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let (worker_reader, worker_writer) = tokio::io::split(theirs);

        let factory = self.factory.clone();
        let spec = spec.clone();
        let model_id = spec.model_id().to_string();

        let handle = tokio::spawn(async move {
            let outcome = if download {
                run_download(spec, &factory, worker_writer).await
            } else {
                run_worker(spec, &factory, worker_reader, worker_writer).await
            };
            if let Err(e) = outcome {
                tracing::debug!("in-process worker ended with error: {}", e);
            }
        });

        if !download {
            *self.launches.lock().entry(model_id.clone()).or_default() += 1;
            self.tasks.lock().insert(model_id, handle.abort_handle());
        }

        Ok(WorkerChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(TaskProcess {
                handle: Some(handle),
            }),
        })
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerChannel> {
        self.start(spec, false)
    }

    fn launch_download(&self, spec: &LaunchSpec) -> Result<WorkerChannel> {
        self.start(spec, true)
    }
}

pub fn entry(model_id: &str, class: &str, input: &str, output: &str, dir: &Path) -> ModelInfo {
    ModelInfo {
        model_id: model_id.to_string(),
        construction_class: class.to_string(),
        storage_dir: dir.join(model_id),
        modality: Modality::new(input, output),
        config: json!({}),
    }
}

pub fn fast_settings(models_dir: PathBuf) -> SupervisorSettings {
    SupervisorSettings {
        device: "cpu".to_string(),
        models_dir,
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        terminate_timeout: Duration::from_millis(500),
        download_timeout: Duration::from_secs(5),
        liveness_probe_interval: Duration::from_millis(20),
        spawn_retries: 2,
        spawn_retry_backoff: Duration::from_millis(5),
        health_check_interval: Duration::from_millis(50),
        max_frame_bytes: 1024 * 1024,
    }
}

/// A supervisor over an in-memory registry with a few downloaded models
pub struct Rig {
    pub supervisor: Arc<ProcessSupervisor>,
    pub registry: Arc<JsonModelRegistry>,
    pub usage: Arc<UsageTracker>,
    pub launcher: Arc<InProcessLauncher>,
    pub dir: TempDir,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut SupervisorSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JsonModelRegistry::in_memory());
        for (id, class, output) in [
            ("upper", "uppercase", "text"),
            ("echo", "echo", "text"),
            ("sink", "pixel-sink", "image"),
            ("broken", "broken", "text"),
            ("panicky", "panicky", "text"),
        ] {
            registry
                .record_download(id, entry(id, class, "text", output, dir.path()))
                .unwrap();
        }

        let mut settings = fast_settings(dir.path().join("models"));
        tweak(&mut settings);

        let usage = Arc::new(UsageTracker::in_memory());
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            usage.clone(),
            launcher.clone(),
            settings,
        ));

        Self {
            supervisor,
            registry,
            usage,
            launcher,
            dir,
        }
    }

    /// Record a downloaded `sleepy` model that blocks for `sleep_ms`
    pub fn add_sleepy(&self, model_id: &str, sleep_ms: u64) {
        let mut info = entry(model_id, "sleepy", "text", "text", self.dir.path());
        info.config = json!({ "sleep_ms": sleep_ms });
        self.registry.record_download(model_id, info).unwrap();
    }
}

/// Config rooted in `data_dir` with short timeouts
pub fn hub_config(data_dir: &Path) -> ModelPlayConfig {
    let mut config = ModelPlayConfig::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.supervisor.handshake_timeout_secs = 5;
    config.supervisor.request_timeout_secs = 5;
    config.supervisor.terminate_timeout_secs = 1;
    config.supervisor.liveness_probe_interval_ms = 20;
    config.supervisor.spawn_retry_backoff_ms = 5;
    config
}

/// Catalogue used by the hub tests: `t2t` (text → text), `sink`
/// (text → image), `echo` (text → text) and `broken` (fails to load)
pub const CATALOGUE: [(&str, &str, &str); 4] = [
    ("t2t", "uppercase", "text"),
    ("sink", "pixel-sink", "image"),
    ("echo", "echo", "text"),
    ("broken", "broken", "text"),
];

/// Open a hub in `dir`, seed the catalogue and download every model
pub async fn open_hub(dir: &Path, launcher: Arc<InProcessLauncher>) -> Hub {
    let hub = Hub::open(hub_config(dir), launcher).unwrap();
    if hub.list_downloaded().is_empty() {
        for (id, class, output) in CATALOGUE {
            hub.register_known(entry(id, class, "text", output, dir)).unwrap();
            hub.download_model(id).await.unwrap();
        }
    }
    hub
}
