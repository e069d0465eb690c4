//! Playground definitions
//!
//! A playground is a named set of member models plus an optional ordered
//! chain through which input is piped. Definitions cannot change while the
//! chain is active.

use crate::registry::ModelRegistry;
use crate::store::DocumentStore;
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_proto::Modality;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// A user-defined pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playground {
    pub playground_id: String,

    #[serde(default)]
    pub description: String,

    /// Member models and their declared modality
    #[serde(default)]
    pub models: BTreeMap<String, Modality>,

    /// Ordered subset of `models`
    #[serde(default)]
    pub chain: Vec<String>,

    #[serde(default)]
    pub active_chain: bool,
}

impl Playground {
    pub(crate) fn ensure_inactive(&self, action: &str) -> Result<()> {
        if self.active_chain {
            return Err(ModelPlayError::conflict(format!(
                "cannot {} playground {} while its chain is active",
                action, self.playground_id
            )));
        }
        Ok(())
    }
}

/// Fields `update` may change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaygroundUpdate {
    /// Rename the playground
    pub new_id: Option<String>,
    pub description: Option<String>,
}

pub type PlaygroundMap = BTreeMap<String, Playground>;

/// Persisted CRUD over playgrounds
pub struct PlaygroundStore {
    doc: DocumentStore<PlaygroundMap>,
    registry: Arc<dyn ModelRegistry>,
}

impl std::fmt::Debug for PlaygroundStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaygroundStore")
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ModelPlayError::validation("playground id must not be empty"));
    }
    Ok(())
}

fn missing(playground_id: &str) -> ModelPlayError {
    ModelPlayError::not_found(format!("playground {} does not exist", playground_id))
}

impl PlaygroundStore {
    pub fn open<P: Into<PathBuf>>(path: P, registry: Arc<dyn ModelRegistry>) -> Result<Self> {
        Ok(Self {
            doc: DocumentStore::open(path)?,
            registry,
        })
    }

    pub fn in_memory(registry: Arc<dyn ModelRegistry>) -> Self {
        Self {
            doc: DocumentStore::in_memory(),
            registry,
        }
    }

    /// Create a playground, generating an id when none is given
    pub fn create(&self, playground_id: Option<String>, description: impl Into<String>) -> Result<Playground> {
        let playground_id = playground_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_id(&playground_id)?;

        let playground = Playground {
            playground_id: playground_id.clone(),
            description: description.into(),
            models: BTreeMap::new(),
            chain: Vec::new(),
            active_chain: false,
        };

        self.doc.update(|map| {
            if map.contains_key(&playground_id) {
                return Err(ModelPlayError::conflict(format!(
                    "playground {} already exists",
                    playground_id
                )));
            }
            map.insert(playground_id.clone(), playground.clone());
            Ok(())
        })?;

        info!("Created playground {}", playground_id);
        Ok(playground)
    }

    pub fn get(&self, playground_id: &str) -> Result<Playground> {
        self.doc
            .read(|map| map.get(playground_id).cloned())
            .ok_or_else(|| missing(playground_id))
    }

    pub fn list(&self) -> Vec<Playground> {
        self.doc.read(|map| map.values().cloned().collect())
    }

    /// Change description and/or id of an inactive playground
    pub fn update(&self, playground_id: &str, update: PlaygroundUpdate) -> Result<Playground> {
        if let Some(new_id) = &update.new_id {
            validate_id(new_id)?;
        }

        let updated = self.doc.update(|map| {
            let mut playground = map.get(playground_id).cloned().ok_or_else(|| missing(playground_id))?;
            playground.ensure_inactive("update")?;

            if let Some(description) = update.description {
                playground.description = description;
            }
            if let Some(new_id) = update.new_id.filter(|id| id != playground_id) {
                if map.contains_key(&new_id) {
                    return Err(ModelPlayError::conflict(format!(
                        "playground {} already exists",
                        new_id
                    )));
                }
                map.remove(playground_id);
                playground.playground_id = new_id;
            }

            map.insert(playground.playground_id.clone(), playground.clone());
            Ok(playground)
        })?;

        info!("Updated playground {}", updated.playground_id);
        Ok(updated)
    }

    pub fn delete(&self, playground_id: &str) -> Result<()> {
        self.doc.update(|map| {
            let playground = map.get(playground_id).ok_or_else(|| missing(playground_id))?;
            playground.ensure_inactive("delete")?;
            map.remove(playground_id);
            Ok(())
        })?;
        info!("Deleted playground {}", playground_id);
        Ok(())
    }

    /// Add a downloaded model as a member. Adding an existing member is a no-op.
    pub fn add_model(&self, playground_id: &str, model_id: &str) -> Result<Playground> {
        let modality = self.registry.get_model_info(model_id)?.modality;

        self.modify(playground_id, |playground| {
            playground.ensure_inactive("add models to")?;
            playground
                .models
                .entry(model_id.to_string())
                .or_insert(modality);
            Ok(playground.clone())
        })
    }

    /// Remove a member. Removing a non-member is a no-op; removing a model the
    /// chain still references is refused.
    pub fn remove_model(&self, playground_id: &str, model_id: &str) -> Result<Playground> {
        self.modify(playground_id, |playground| {
            playground.ensure_inactive("remove models from")?;
            if playground.chain.iter().any(|id| id == model_id) {
                return Err(ModelPlayError::conflict(format!(
                    "model {} is part of the chain of playground {}; reconfigure the chain first",
                    model_id, playground_id
                )));
            }
            playground.models.remove(model_id);
            Ok(playground.clone())
        })
    }

    /// Atomically flip `active_chain` from `expected` to `!expected`
    pub fn set_active(&self, playground_id: &str, expected: bool) -> Result<Playground> {
        self.modify(playground_id, |playground| {
            if playground.active_chain != expected {
                return Err(ModelPlayError::conflict(format!(
                    "chain of playground {} is {}",
                    playground_id,
                    if playground.active_chain { "already active" } else { "not active" }
                )));
            }
            playground.active_chain = !expected;
            Ok(playground.clone())
        })
    }

    /// Apply `f` to one playground inside a single persisted update
    pub fn modify<R>(&self, playground_id: &str, f: impl FnOnce(&mut Playground) -> Result<R>) -> Result<R> {
        self.doc.update(|map| {
            let playground = map.get_mut(playground_id).ok_or_else(|| missing(playground_id))?;
            f(playground)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JsonModelRegistry;
    use modelplay_proto::ModelInfo;
    use serde_json::json;

    fn store() -> PlaygroundStore {
        let registry = JsonModelRegistry::in_memory();
        for (id, output) in [("t2t", "text"), ("sink", "image")] {
            registry
                .record_download(
                    id,
                    ModelInfo {
                        model_id: id.to_string(),
                        construction_class: "echo".to_string(),
                        storage_dir: PathBuf::from(id),
                        modality: Modality::new("text", output),
                        config: json!({}),
                    },
                )
                .unwrap();
        }
        PlaygroundStore::in_memory(Arc::new(registry))
    }

    #[test]
    fn test_create_generates_id_and_rejects_duplicates() {
        let store = store();

        let generated = store.create(None, "scratch").unwrap();
        assert!(!generated.playground_id.is_empty());

        store.create(Some("p1".to_string()), "").unwrap();
        let err = store.create(Some("p1".to_string()), "").unwrap_err();
        assert!(matches!(err, ModelPlayError::Conflict(_)));
    }

    #[test]
    fn test_add_model_is_idempotent_and_records_modality() {
        let store = store();
        store.create(Some("p1".to_string()), "").unwrap();

        store.add_model("p1", "sink").unwrap();
        let playground = store.add_model("p1", "sink").unwrap();

        assert_eq!(playground.models.len(), 1);
        assert_eq!(playground.models["sink"], Modality::new("text", "image"));
    }

    #[test]
    fn test_add_unknown_model_is_not_found() {
        let store = store();
        store.create(Some("p1".to_string()), "").unwrap();

        let err = store.add_model("p1", "ghost").unwrap_err();
        assert!(matches!(err, ModelPlayError::NotFound(_)));
    }

    #[test]
    fn test_remove_model_referenced_by_chain_is_refused() {
        let store = store();
        store.create(Some("p1".to_string()), "").unwrap();
        store.add_model("p1", "t2t").unwrap();
        store
            .modify("p1", |p| {
                p.chain = vec!["t2t".to_string()];
                Ok(())
            })
            .unwrap();

        let err = store.remove_model("p1", "t2t").unwrap_err();
        assert!(matches!(err, ModelPlayError::Conflict(_)));

        // non-member removal is a no-op
        assert!(store.remove_model("p1", "sink").is_ok());
    }

    #[test]
    fn test_rename_and_active_guard() {
        let store = store();
        store.create(Some("p1".to_string()), "old").unwrap();

        let renamed = store
            .update(
                "p1",
                PlaygroundUpdate {
                    new_id: Some("p2".to_string()),
                    description: Some("new".to_string()),
                },
            )
            .unwrap();
        assert_eq!(renamed.playground_id, "p2");
        assert!(store.get("p1").is_err());

        store.set_active("p2", false).unwrap();
        let err = store.delete("p2").unwrap_err();
        assert!(matches!(err, ModelPlayError::Conflict(_)));
        let err = store.update("p2", PlaygroundUpdate::default()).unwrap_err();
        assert!(matches!(err, ModelPlayError::Conflict(_)));

        store.set_active("p2", true).unwrap();
        store.delete("p2").unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_set_active_is_compare_and_set() {
        let store = store();
        store.create(Some("p1".to_string()), "").unwrap();

        store.set_active("p1", false).unwrap();
        assert!(matches!(
            store.set_active("p1", false),
            Err(ModelPlayError::Conflict(_))
        ));
    }
}
