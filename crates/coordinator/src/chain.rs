//! Playground chain execution
//!
//! A chain is loaded by acquiring every member model on behalf of the
//! playground and stopped by releasing them again; models shared with other
//! active playgrounds keep running. Operations that load, stop or mutate one
//! playground are serialised on a per-playground lock.

use crate::playground::{Playground, PlaygroundStore};
use crate::supervisor::{ProcessSupervisor, Release};
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_common::metrics::LatencyTimer;
use modelplay_common::METRICS;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Check `chain` against the members of `playground`.
///
/// Every entry must be a member; every entry but the last must be text to
/// text.
pub fn validate_chain(playground: &Playground, chain: &[String]) -> Result<()> {
    for (i, model_id) in chain.iter().enumerate() {
        let modality = playground.models.get(model_id).ok_or_else(|| {
            ModelPlayError::not_found(format!(
                "model {} is not a member of playground {}",
                model_id, playground.playground_id
            ))
        })?;

        let last = i + 1 == chain.len();
        if !last && !modality.is_text_to_text() {
            return Err(ModelPlayError::incompatible(format!(
                "model {} ({} -> {}) cannot feed the next stage; only text -> text models may precede the last position",
                model_id, modality.input, modality.output
            )));
        }
    }
    Ok(())
}

/// Text handed to the next stage as its `payload`
pub fn stage_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What [`ChainExecutor::recover`] did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Playgrounds whose chains are running again
    pub restored: Vec<String>,
    /// Playgrounds marked inactive because their chain failed to load
    pub deactivated: Vec<String>,
}

/// Held locks of one or more playgrounds. Dropping it releases them and
/// forgets locks nobody else is waiting on.
struct PlaygroundLocks<'a> {
    executor: &'a ChainExecutor,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for PlaygroundLocks<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.executor.prune_locks();
    }
}

pub struct ChainExecutor {
    store: Arc<PlaygroundStore>,
    supervisor: Arc<ProcessSupervisor>,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl ChainExecutor {
    pub fn new(store: Arc<PlaygroundStore>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            store,
            supervisor,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, playground_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(playground_id.to_string())
            .or_default()
            .clone()
    }

    /// Lock every id in `playground_ids`, always in sorted order so two
    /// callers locking overlapping sets cannot deadlock.
    async fn lock_playgrounds(&self, playground_ids: &[&str]) -> PlaygroundLocks<'_> {
        let unique: BTreeSet<&str> = playground_ids.iter().copied().collect();
        let mut guards = Vec::with_capacity(unique.len());
        for playground_id in unique {
            guards.push(self.lock_for(playground_id).lock_owned().await);
        }
        PlaygroundLocks {
            executor: self,
            guards,
        }
    }

    /// Drop locks that only the map still refers to
    fn prune_locks(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }

    /// Run `f` while holding the locks of every playground in
    /// `playground_ids`, so it cannot interleave with a chain load or stop of
    /// any of them. A rename passes both the old and the new id.
    pub async fn exclusive<R>(&self, playground_ids: &[&str], f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _locks = self.lock_playgrounds(playground_ids).await;
        f()
    }

    /// Validate and store a new chain for an inactive playground
    pub async fn configure_chain(&self, playground_id: &str, chain: Vec<String>) -> Result<Vec<String>> {
        let _locks = self.lock_playgrounds(&[playground_id]).await;

        let stored = self.store.modify(playground_id, |playground| {
            playground.ensure_inactive("reconfigure the chain of")?;
            validate_chain(playground, &chain)?;
            playground.chain = chain;
            Ok(playground.chain.clone())
        })?;

        info!("Configured chain of {}: {:?}", playground_id, stored);
        Ok(stored)
    }

    /// Load every model of the chain and mark the playground active.
    ///
    /// If any model fails to load, the models acquired so far are released
    /// again and the playground stays inactive.
    pub async fn load_playground_chain(&self, playground_id: &str) -> Result<Playground> {
        let _locks = self.lock_playgrounds(&[playground_id]).await;

        let playground = self.store.get(playground_id)?;
        if playground.active_chain {
            return Err(ModelPlayError::conflict(format!(
                "chain of playground {} is already active",
                playground_id
            )));
        }

        self.acquire_chain(&playground).await?;

        let activated = match self.store.set_active(playground_id, false) {
            Ok(activated) => activated,
            Err(e) => {
                self.release_chain(playground_id, &playground.chain).await;
                return Err(e);
            }
        };

        METRICS.chain.loads_total.inc();
        METRICS.chain.active_chains.inc();
        info!("Loaded chain of {} ({} models)", playground_id, activated.chain.len());
        Ok(activated)
    }

    /// Release every model of the chain and mark the playground inactive.
    /// Individual release failures are logged and do not stop the rest.
    pub async fn stop_playground_chain(&self, playground_id: &str) -> Result<Playground> {
        let _locks = self.lock_playgrounds(&[playground_id]).await;

        let playground = self.store.get(playground_id)?;
        if !playground.active_chain {
            return Err(ModelPlayError::conflict(format!(
                "chain of playground {} is not active",
                playground_id
            )));
        }

        self.release_chain(playground_id, &playground.chain).await;
        let stopped = self.store.set_active(playground_id, true)?;

        METRICS.chain.stops_total.inc();
        METRICS.chain.active_chains.dec();
        info!("Stopped chain of {}", playground_id);
        Ok(stopped)
    }

    /// Pipe `data` through the active chain and return the last stage's
    /// output unchanged.
    pub async fn inference(&self, playground_id: &str, data: Value) -> Result<Value> {
        let playground = self.store.get(playground_id)?;
        if !playground.active_chain {
            return Err(ModelPlayError::conflict(format!(
                "chain of playground {} is not active",
                playground_id
            )));
        }
        if playground.chain.is_empty() {
            return Err(ModelPlayError::validation(format!(
                "playground {} has an empty chain",
                playground_id
            )));
        }

        METRICS
            .chain
            .inference_duration
            .observe_async(self.run_stages(&playground.chain, data))
            .await
    }

    async fn run_stages(&self, chain: &[String], data: Value) -> Result<Value> {
        let mut input = data;
        let (last, init) = chain
            .split_last()
            .ok_or_else(|| ModelPlayError::internal("empty chain"))?;

        for model_id in init {
            let output = self.supervisor.inference(model_id, input).await?;
            input = json!({ "payload": stage_text(&output) });
        }
        self.supervisor.inference(last, input).await
    }

    /// Bring the runtime back in line with the persisted playgrounds after a
    /// restart. Usage entries of inactive playgrounds are dropped; active
    /// chains are loaded again or, failing that, deactivated.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let playgrounds = self.store.list();
        let active: BTreeSet<String> = playgrounds
            .iter()
            .filter(|p| p.active_chain)
            .map(|p| p.playground_id.clone())
            .collect();

        self.supervisor
            .usage()
            .retain_playgrounds(|id| active.contains(id))?;

        let mut report = RecoveryReport::default();
        for playground in playgrounds.into_iter().filter(|p| p.active_chain) {
            let _locks = self.lock_playgrounds(&[playground.playground_id.as_str()]).await;

            match self.acquire_chain(&playground).await {
                Ok(()) => {
                    METRICS.chain.active_chains.inc();
                    info!("Recovered chain of {}", playground.playground_id);
                    report.restored.push(playground.playground_id);
                }
                Err(e) => {
                    error!(
                        "Could not recover chain of {}, deactivating: {}",
                        playground.playground_id, e
                    );
                    if let Err(e) = self.store.set_active(&playground.playground_id, true) {
                        error!(
                            "Could not mark {} inactive, it stays active on disk: {}",
                            playground.playground_id, e
                        );
                    }
                    report.deactivated.push(playground.playground_id);
                }
            }
        }
        Ok(report)
    }

    /// Acquire each chain model for the playground, releasing them all again
    /// if one fails.
    async fn acquire_chain(&self, playground: &Playground) -> Result<()> {
        let playground_id = &playground.playground_id;
        let mut acquired: Vec<String> = Vec::new();

        for model_id in &playground.chain {
            if let Err(e) = self.supervisor.acquire(model_id, playground_id).await {
                error!(
                    "Loading {} for playground {} failed, rolling back: {}",
                    model_id, playground_id, e
                );
                METRICS.chain.load_rollbacks_total.inc();
                self.rollback(playground, &acquired).await;
                return Err(e);
            }
            acquired.push(model_id.clone());
        }
        Ok(())
    }

    /// Undo a partial [`Self::acquire_chain`]. Acquired models are released;
    /// every other chain member only loses the playground as a dependent,
    /// since usage from an earlier run may still name it and the worker, if
    /// any, belongs to someone else.
    async fn rollback(&self, playground: &Playground, acquired: &[String]) {
        let playground_id = &playground.playground_id;
        self.release_chain(playground_id, acquired).await;

        let untouched: BTreeSet<&String> = playground
            .chain
            .iter()
            .filter(|model_id| !acquired.contains(model_id))
            .collect();
        for model_id in untouched {
            match self.supervisor.usage().detach(model_id, playground_id) {
                Ok(_) => debug!("Dropped {} as dependent of {}", playground_id, model_id),
                Err(e) => warn!("Could not detach {} from {}: {}", model_id, playground_id, e),
            }
        }
    }

    async fn release_chain(&self, playground_id: &str, chain: &[String]) {
        let unique: BTreeSet<&String> = chain.iter().collect();
        for model_id in unique {
            match self.supervisor.release(model_id, playground_id).await {
                Ok(Release::Unloaded) => info!("Unloaded {} (no dependents left)", model_id),
                Ok(Release::StillInUse(n)) => info!("{} kept loaded for {} other playground(s)", model_id, n),
                Ok(Release::NotLoaded) => {}
                Err(e) => error!("Releasing {} for {} failed: {}", model_id, playground_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ProcessLauncher;
    use crate::registry::JsonModelRegistry;
    use crate::supervisor::SupervisorSettings;
    use crate::usage::UsageTracker;
    use modelplay_proto::Modality;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn playground() -> Playground {
        let mut models = BTreeMap::new();
        models.insert("a".to_string(), Modality::new("text", "text"));
        models.insert("b".to_string(), Modality::new("text", "image"));
        models.insert("c".to_string(), Modality::new("audio", "text"));
        Playground {
            playground_id: "p".to_string(),
            description: String::new(),
            models,
            chain: Vec::new(),
            active_chain: false,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_non_text_model_before_last_is_incompatible() {
        let err = validate_chain(&playground(), &ids(&["a", "b", "a"])).unwrap_err();
        match err {
            ModelPlayError::Incompatible(msg) => assert!(msg.contains("model b")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_last_position_is_unconstrained() {
        assert!(validate_chain(&playground(), &ids(&["a", "b"])).is_ok());
        assert!(validate_chain(&playground(), &ids(&["c"])).is_ok());
        assert!(validate_chain(&playground(), &[]).is_ok());
    }

    #[test]
    fn test_first_position_input_is_unconstrained_only_when_last() {
        // c takes audio, so it may only be the sole or final stage
        let err = validate_chain(&playground(), &ids(&["c", "a"])).unwrap_err();
        assert!(matches!(err, ModelPlayError::Incompatible(_)));
    }

    #[test]
    fn test_non_member_is_not_found() {
        let err = validate_chain(&playground(), &ids(&["a", "zzz"])).unwrap_err();
        assert!(matches!(err, ModelPlayError::NotFound(_)));
    }

    #[test]
    fn test_stage_text() {
        assert_eq!(stage_text(&json!("hi")), "hi");
        assert_eq!(stage_text(&json!({"k": 1})), r#"{"k":1}"#);
        assert_eq!(stage_text(&json!(3)), "3");
    }

    fn executor() -> Arc<ChainExecutor> {
        let registry = Arc::new(JsonModelRegistry::in_memory());
        let store = Arc::new(PlaygroundStore::in_memory(registry.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry,
            Arc::new(UsageTracker::in_memory()),
            Arc::new(ProcessLauncher::new("/nonexistent/modelplay-worker")),
            SupervisorSettings::default(),
        ));
        Arc::new(ChainExecutor::new(store, supervisor))
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_every_listed_playground() {
        let executor = executor();
        let held = executor.lock_playgrounds(&["new"]).await;

        let renamer = executor.clone();
        let task = tokio::spawn(async move { renamer.exclusive(&["old", "new"], || Ok(())).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        drop(held);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_locks_are_forgotten_once_released() {
        let executor = executor();
        for id in ["a", "b", "c"] {
            executor.exclusive(&[id, "shared"], || Ok(())).await.unwrap();
        }
        assert_eq!(executor.tracked_locks(), 0);

        let held = executor.lock_playgrounds(&["a", "b"]).await;
        // a third caller finishing must not drop locks still held
        executor.exclusive(&["c"], || Ok(())).await.unwrap();
        assert_eq!(executor.tracked_locks(), 2);
        drop(held);
        assert_eq!(executor.tracked_locks(), 0);

        // unknown playground: the lock goes away on the error path too
        assert!(executor.stop_playground_chain("ghost").await.is_err());
        assert_eq!(executor.tracked_locks(), 0);
    }
}
