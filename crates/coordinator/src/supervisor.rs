//! Model process supervision
//!
//! The supervisor owns every worker. Each model id has one slot whose async
//! mutex guards the worker's pipe pair, so at most one request is in flight
//! per worker and concurrent callers for the same model queue on the lock.
//! Every blocking wait on a worker is bounded and periodically checks that
//! the worker process is still alive.

use crate::launcher::{WorkerChannel, WorkerLauncher, WorkerProcess, BoxedWriter};
use crate::registry::ModelRegistry;
use crate::usage::UsageTracker;
use modelplay_common::config::ModelPlayConfig;
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_common::METRICS;
use modelplay_proto::{
    encode_frame, merge_config, read_frame, write_encoded, Envelope, FrameError, LaunchSpec, ModelInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Terminating,
    Dead,
}

impl WorkerState {
    pub fn is_loaded(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

/// Outcome of [`ProcessSupervisor::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Last dependent gone, worker terminated
    Unloaded,
    /// Other playgrounds still depend on the model
    StillInUse(usize),
    /// No dependents left and no worker was running
    NotLoaded,
}

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub device: String,
    pub models_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub terminate_timeout: Duration,
    pub download_timeout: Duration,
    pub liveness_probe_interval: Duration,
    pub spawn_retries: u32,
    pub spawn_retry_backoff: Duration,
    pub health_check_interval: Duration,
    pub max_frame_bytes: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &ModelPlayConfig) -> Self {
        let s = &config.supervisor;
        Self {
            device: s.device.clone(),
            models_dir: config.storage.models_path(),
            handshake_timeout: s.handshake_timeout(),
            request_timeout: s.request_timeout(),
            terminate_timeout: s.terminate_timeout(),
            download_timeout: s.download_timeout(),
            liveness_probe_interval: s.liveness_probe_interval(),
            spawn_retries: s.spawn_retries,
            spawn_retry_backoff: s.spawn_retry_backoff(),
            health_check_interval: s.health_check_interval(),
            max_frame_bytes: s.max_frame_bytes,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ModelPlayConfig::default())
    }
}

/// Supervisor side of one running worker
struct WorkerLink {
    writer: BoxedWriter,
    inbox: mpsc::Receiver<std::result::Result<Envelope, FrameError>>,
    reader: JoinHandle<()>,
    process: Box<dyn WorkerProcess>,
}

impl WorkerLink {
    /// Start forwarding frames from the worker into a queue, so that timed
    /// waits never cancel a half-read frame.
    fn start(channel: WorkerChannel, max_frame_bytes: usize) -> Self {
        let WorkerChannel {
            mut reader,
            writer,
            process,
        } = channel;
        let (tx, inbox) = mpsc::channel(4);

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max_frame_bytes).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Self {
            writer,
            inbox,
            reader,
            process,
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = encode_frame(envelope, u32::MAX as usize)
            .map_err(|e| ModelPlayError::transport(format!("failed to encode {}: {}", envelope.kind(), e)))?;
        self.send_encoded(&frame, envelope.kind()).await
    }

    async fn send_encoded(&mut self, frame: &[u8], kind: &str) -> Result<()> {
        write_encoded(&mut self.writer, frame)
            .await
            .map_err(|e| ModelPlayError::transport(format!("failed to send {}: {}", kind, e)))
    }

    /// Wait up to `timeout` for the next frame, probing liveness every
    /// `probe` so a crashed worker fails the wait early.
    async fn recv(&mut self, timeout: Duration, probe: Duration) -> Result<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ModelPlayError::timeout(format!(
                    "no reply from worker within {:?}",
                    timeout
                )));
            }

            match tokio::time::timeout(remaining.min(probe), self.inbox.recv()).await {
                Ok(Some(Ok(frame))) => return Ok(frame),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(ModelPlayError::transport("worker closed its channel")),
                Err(_) => {
                    if !self.process.is_alive() {
                        // a frame written just before exit may still be in flight
                        return match tokio::time::timeout(probe, self.inbox.recv()).await {
                            Ok(Some(Ok(frame))) => Ok(frame),
                            _ => Err(ModelPlayError::transport("worker process exited")),
                        };
                    }
                }
            }
        }
    }

    async fn call(&mut self, envelope: &Envelope, timeout: Duration, probe: Duration) -> Result<Envelope> {
        self.send(envelope).await?;
        self.recv(timeout, probe).await
    }

    async fn call_encoded(&mut self, frame: &[u8], kind: &str, timeout: Duration, probe: Duration) -> Result<Envelope> {
        self.send_encoded(frame, kind).await?;
        self.recv(timeout, probe).await
    }

    /// Wait for the process to exit on its own, killing it after `grace`
    async fn join(mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.process.wait()).await.is_err() {
            warn!("Worker pid={:?} did not exit within {:?}, killing", self.process.id(), grace);
            self.kill_and_wait(grace).await;
        }
        self.reader.abort();
    }

    /// Kill immediately and reap
    async fn reap(mut self, grace: Duration) {
        self.kill_and_wait(grace).await;
        self.reader.abort();
    }

    async fn kill_and_wait(&mut self, grace: Duration) {
        if let Err(e) = self.process.start_kill() {
            debug!("Kill of worker pid={:?} failed: {}", self.process.id(), e);
        }
        if tokio::time::timeout(grace, self.process.wait()).await.is_err() {
            error!("Worker pid={:?} could not be reaped", self.process.id());
        }
    }
}

/// Per-model state; never removed from the slot map so that every caller
/// for a model id serialises on the same lock.
struct WorkerSlot {
    state: parking_lot::Mutex<WorkerState>,
    link: tokio::sync::Mutex<Option<WorkerLink>>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(WorkerState::Dead),
            link: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// Creates, drives and destroys model workers
pub struct ProcessSupervisor {
    registry: Arc<dyn ModelRegistry>,
    usage: Arc<UsageTracker>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorSettings,
    slots: parking_lot::Mutex<HashMap<String, Arc<WorkerSlot>>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("settings", &self.settings)
            .field("loaded", &self.loaded_models())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        usage: Arc<UsageTracker>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            usage,
            launcher,
            settings,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    fn slot(&self, model_id: &str) -> Arc<WorkerSlot> {
        self.slots
            .lock()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(WorkerSlot::new()))
            .clone()
    }

    fn existing_slot(&self, model_id: &str) -> Option<Arc<WorkerSlot>> {
        self.slots.lock().get(model_id).cloned()
    }

    fn not_loaded(model_id: &str) -> ModelPlayError {
        ModelPlayError::not_found(format!("model {} is not loaded", model_id))
    }

    /// Whether a worker for `model_id` is Ready or Busy
    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.status(model_id).is_some_and(WorkerState::is_loaded)
    }

    /// Current worker state, if the model was ever loaded
    pub fn status(&self, model_id: &str) -> Option<WorkerState> {
        self.existing_slot(model_id).map(|slot| slot.state())
    }

    /// Ids of all Ready or Busy workers, sorted
    pub fn loaded_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state().is_loaded())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Load `model_id`; a no-op if a live worker already hosts it
    pub async fn load(&self, model_id: &str) -> Result<()> {
        let slot = self.slot(model_id);
        let mut link = slot.link.lock().await;
        self.ensure_loaded(model_id, &slot, &mut link).await
    }

    /// Load `model_id` if needed and record `playground_id` as a dependent,
    /// atomically with respect to other acquire/release/unload calls for the
    /// same model.
    pub async fn acquire(&self, model_id: &str, playground_id: &str) -> Result<()> {
        let slot = self.slot(model_id);
        let mut link = slot.link.lock().await;
        self.ensure_loaded(model_id, &slot, &mut link).await?;
        self.usage.attach(model_id, playground_id)
    }

    /// Drop `playground_id` as a dependent and terminate the worker if no
    /// dependents remain.
    pub async fn release(&self, model_id: &str, playground_id: &str) -> Result<Release> {
        let slot = self.slot(model_id);
        let mut link = slot.link.lock().await;

        let remaining = self.usage.detach(model_id, playground_id)?;
        if !remaining.is_empty() {
            debug!("{} still used by {:?}", model_id, remaining);
            return Ok(Release::StillInUse(remaining.len()));
        }

        match link.take() {
            Some(live) => {
                self.shutdown_link(model_id, &slot, live).await;
                Ok(Release::Unloaded)
            }
            None => Ok(Release::NotLoaded),
        }
    }

    /// Terminate the worker for `model_id`.
    ///
    /// Refused while any playground still depends on the model.
    pub async fn unload(&self, model_id: &str) -> Result<()> {
        let slot = self.existing_slot(model_id).ok_or_else(|| Self::not_loaded(model_id))?;
        let mut link = slot.link.lock().await;

        let dependents = self.usage.dependents(model_id);
        if !dependents.is_empty() {
            let names: Vec<_> = dependents.into_iter().collect();
            return Err(ModelPlayError::resource_busy(format!(
                "model {} is used by playgrounds: {}",
                model_id,
                names.join(", ")
            )));
        }

        let live = link.take().ok_or_else(|| Self::not_loaded(model_id))?;
        self.shutdown_link(model_id, &slot, live).await;
        Ok(())
    }

    /// Run one inference on the worker hosting `model_id`
    pub async fn inference(&self, model_id: &str, data: Value) -> Result<Value> {
        METRICS.inference.requests_total.inc();
        let timer = METRICS.inference.request_duration.start_timer();

        let result = self
            .request(model_id, Envelope::inference(model_id, data))
            .await;

        timer.observe_duration();
        if result.is_err() {
            METRICS.inference.requests_failed.inc();
        }
        result
    }

    /// Merge `config` into the model's configuration.
    ///
    /// A live worker reloads its instance first; the merged config is then
    /// stored in the registry so later loads use it too.
    pub async fn configure(&self, model_id: &str, config: Value) -> Result<Value> {
        let patch = config
            .as_object()
            .ok_or_else(|| ModelPlayError::validation("configuration must be a JSON object"))?;
        let info = self.registry.get_model_info(model_id)?;
        let merged = merge_config(&info.config, patch);

        if self.is_loaded(model_id) {
            match self.request(model_id, Envelope::configure(model_id, config.clone())).await {
                Ok(_) => info!("Reconfigured live worker for {}", model_id),
                // unloaded between the check and the request
                Err(ModelPlayError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.registry.update_config(model_id, merged.clone())?;
        Ok(merged)
    }

    /// Download a known model in a throwaway worker process and record it in
    /// the registry.
    pub async fn download(&self, model_id: &str) -> Result<ModelInfo> {
        let known = self.registry.known_model(model_id)?;
        let spec = LaunchSpec {
            model: ModelInfo {
                storage_dir: self.settings.models_dir.join(model_id),
                ..known
            },
            device: self.settings.device.clone(),
            max_frame_bytes: self.settings.max_frame_bytes,
        };

        let channel = self.spawn_with_retries(&spec, true).await?;
        let mut link = WorkerLink::start(channel, self.settings.max_frame_bytes);

        let outcome = link
            .recv(self.settings.download_timeout, self.settings.liveness_probe_interval)
            .await;

        let entry = match outcome {
            Ok(Envelope::Reply { data }) => {
                link.join(self.settings.terminate_timeout).await;
                serde_json::from_value::<ModelInfo>(data)?
            }
            Ok(Envelope::Error { message }) => {
                link.join(self.settings.terminate_timeout).await;
                return Err(ModelPlayError::model(format!("download of {} failed: {}", model_id, message)));
            }
            Ok(other) => {
                link.reap(self.settings.terminate_timeout).await;
                return Err(ModelPlayError::transport(format!(
                    "unexpected {} frame from download worker",
                    other.kind()
                )));
            }
            Err(e) => {
                link.reap(self.settings.terminate_timeout).await;
                return Err(e);
            }
        };

        self.registry.record_download(model_id, entry.clone())?;
        info!("Downloaded {} into {}", model_id, entry.storage_dir.display());
        Ok(entry)
    }

    /// Terminate every worker; used on shutdown
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<WorkerSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (model_id, slot) in slots {
            let mut link = slot.link.lock().await;
            if let Some(live) = link.take() {
                self.shutdown_link(&model_id, &slot, live).await;
            }
        }
        info!("All workers stopped");
    }

    /// Reap workers whose process has died. Workers currently serving a
    /// request are skipped; their caller notices the failure itself.
    pub async fn reap_dead_workers(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<WorkerSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut reaped = Vec::new();
        for (model_id, slot) in slots {
            let Ok(mut link) = slot.link.try_lock() else {
                continue;
            };
            let dead = link.as_mut().is_some_and(|live| !live.process.is_alive());
            if dead {
                if let Some(live) = link.take() {
                    warn!("Worker for {} died unexpectedly", model_id);
                    self.discard_link(&slot, live, true).await;
                    reaped.push(model_id);
                }
            }
        }
        reaped
    }

    /// Start background health check task
    pub fn start_health_checks(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.health_check_interval);

            loop {
                interval.tick().await;
                let reaped = self.reap_dead_workers().await;
                if !reaped.is_empty() {
                    warn!("Health check reaped dead workers: {:?}", reaped);
                }
            }
        })
    }

    async fn ensure_loaded(
        &self,
        model_id: &str,
        slot: &WorkerSlot,
        link: &mut Option<WorkerLink>,
    ) -> Result<()> {
        if let Some(live) = link.as_mut() {
            if live.process.is_alive() {
                debug!("{} already loaded", model_id);
                return Ok(());
            }
            warn!("Worker for {} found dead, respawning", model_id);
            if let Some(dead) = link.take() {
                self.discard_link(slot, dead, true).await;
            }
        }

        let info = self.registry.get_model_info(model_id)?;
        let spec = LaunchSpec {
            model: info,
            device: self.settings.device.clone(),
            max_frame_bytes: self.settings.max_frame_bytes,
        };

        slot.set_state(WorkerState::Spawning);
        let timer = METRICS.worker.handshake_duration.start_timer();

        let channel = match self.spawn_with_retries(&spec, false).await {
            Ok(channel) => channel,
            Err(e) => {
                slot.set_state(WorkerState::Dead);
                return Err(e);
            }
        };
        let mut fresh = WorkerLink::start(channel, self.settings.max_frame_bytes);

        let handshake = fresh
            .recv(self.settings.handshake_timeout, self.settings.liveness_probe_interval)
            .await;

        let failure = match handshake {
            Ok(Envelope::Handshake { model_id: ref reported }) if reported == model_id => None,
            Ok(Envelope::Error { message }) => Some(ModelPlayError::model(format!(
                "failed to load {}: {}",
                model_id, message
            ))),
            Ok(other) => Some(ModelPlayError::model(format!(
                "failed to load {}: unexpected {} frame during handshake",
                model_id,
                other.kind()
            ))),
            Err(ModelPlayError::Timeout(msg)) => Some(ModelPlayError::timeout(format!(
                "load handshake for {}: {}",
                model_id, msg
            ))),
            Err(e) => Some(ModelPlayError::model(format!("failed to load {}: {}", model_id, e))),
        };

        if let Some(err) = failure {
            timer.stop_and_discard();
            METRICS.worker.spawn_failures_total.inc();
            error!("{}", err);
            fresh.reap(self.settings.terminate_timeout).await;
            slot.set_state(WorkerState::Dead);
            return Err(err);
        }

        timer.observe_duration();
        METRICS.worker.live_workers.inc();
        slot.set_state(WorkerState::Ready);
        *link = Some(fresh);
        info!("Loaded {}", model_id);
        Ok(())
    }

    /// One request/reply round trip on a loaded worker.
    ///
    /// Error envelopes come back as model errors and leave the worker
    /// running; any transport failure or timeout tears the worker down.
    /// Requests too large for a frame are refused before anything is sent.
    async fn request(&self, model_id: &str, envelope: Envelope) -> Result<Value> {
        let slot = self.existing_slot(model_id).ok_or_else(|| Self::not_loaded(model_id))?;
        let mut link = slot.link.lock().await;
        let live = link.as_mut().ok_or_else(|| Self::not_loaded(model_id))?;

        let frame = encode_frame(&envelope, self.settings.max_frame_bytes).map_err(|e| {
            ModelPlayError::validation(format!("request for {} refused: {}", model_id, e))
        })?;

        slot.set_state(WorkerState::Busy);
        let outcome = live
            .call_encoded(
                &frame,
                envelope.kind(),
                self.settings.request_timeout,
                self.settings.liveness_probe_interval,
            )
            .await;

        let failure = match outcome {
            Ok(Envelope::Reply { data }) => {
                slot.set_state(WorkerState::Ready);
                return Ok(data);
            }
            Ok(Envelope::Error { message }) => {
                slot.set_state(WorkerState::Ready);
                return Err(ModelPlayError::model(message));
            }
            Ok(other) => ModelPlayError::transport(format!(
                "unexpected {} frame from worker for {}",
                other.kind(),
                model_id
            )),
            Err(e) => e,
        };

        error!("Worker for {} failed, tearing it down: {}", model_id, failure);
        if let Some(broken) = link.take() {
            self.discard_link(&slot, broken, true).await;
        }
        Err(failure)
    }

    async fn spawn_with_retries(&self, spec: &LaunchSpec, download: bool) -> Result<WorkerChannel> {
        let mut attempt = 0;
        loop {
            let launched = if download {
                self.launcher.launch_download(spec)
            } else {
                self.launcher.launch(spec)
            };

            match launched {
                Ok(channel) => {
                    METRICS.worker.spawned_total.inc();
                    return Ok(channel);
                }
                Err(e) if attempt < self.settings.spawn_retries => {
                    attempt += 1;
                    METRICS.worker.spawn_failures_total.inc();
                    warn!(
                        "Spawn of worker for {} failed (attempt {}): {}",
                        spec.model_id(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.settings.spawn_retry_backoff).await;
                }
                Err(e) => {
                    METRICS.worker.spawn_failures_total.inc();
                    return Err(e);
                }
            }
        }
    }

    /// Graceful terminate: request, await acknowledgment, join the process.
    /// The worker is gone afterwards whether or not it cooperated.
    async fn shutdown_link(&self, model_id: &str, slot: &WorkerSlot, mut live: WorkerLink) {
        slot.set_state(WorkerState::Terminating);
        let grace = self.settings.terminate_timeout;

        match live
            .call(&Envelope::Terminate, grace, self.settings.liveness_probe_interval)
            .await
        {
            Ok(Envelope::Terminating) => live.join(grace).await,
            Ok(other) => {
                warn!("Worker for {} answered terminate with {}, killing", model_id, other.kind());
                live.reap(grace).await;
            }
            Err(e) => {
                warn!("Worker for {} did not acknowledge terminate: {}", model_id, e);
                live.reap(grace).await;
            }
        }

        self.discard_state(slot, false);
        info!("Unloaded {}", model_id);
    }

    async fn discard_link(&self, slot: &WorkerSlot, live: WorkerLink, crashed: bool) {
        live.reap(self.settings.terminate_timeout).await;
        self.discard_state(slot, crashed);
    }

    fn discard_state(&self, slot: &WorkerSlot, crashed: bool) {
        if slot.state() != WorkerState::Dead {
            METRICS.worker.live_workers.dec();
        }
        if crashed {
            METRICS.worker.crashes_total.inc();
        }
        slot.set_state(WorkerState::Dead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_states() {
        assert!(WorkerState::Ready.is_loaded());
        assert!(WorkerState::Busy.is_loaded());
        assert!(!WorkerState::Spawning.is_loaded());
        assert!(!WorkerState::Terminating.is_loaded());
        assert!(!WorkerState::Dead.is_loaded());
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = ModelPlayConfig::default();
        config.supervisor.request_timeout_secs = 9;
        config.storage.data_dir = PathBuf::from("/srv/mp");

        let settings = SupervisorSettings::from_config(&config);

        assert_eq!(settings.request_timeout, Duration::from_secs(9));
        assert_eq!(settings.models_dir, PathBuf::from("/srv/mp/models"));
    }
}
