//! Model registry
//!
//! Durable catalogue of models that are known (downloadable) and models that
//! have been downloaded (loadable). The supervisor only reads construction
//! metadata from it, except for recording downloads and config changes.

use crate::store::DocumentStore;
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_proto::ModelInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Read access to model metadata plus the two writes the supervisor needs
pub trait ModelRegistry: Send + Sync {
    /// Construction metadata of a downloaded model
    fn get_model_info(&self, model_id: &str) -> Result<ModelInfo>;

    /// Catalogue entry of a model that can be downloaded
    fn known_model(&self, model_id: &str) -> Result<ModelInfo>;

    /// Record a finished download
    fn record_download(&self, model_id: &str, entry: ModelInfo) -> Result<()>;

    /// Replace the stored config of a downloaded model
    fn update_config(&self, model_id: &str, config: Value) -> Result<ModelInfo>;

    /// All downloaded models
    fn list_downloaded(&self) -> Vec<ModelInfo>;
}

/// Persisted library document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub known: BTreeMap<String, ModelInfo>,

    #[serde(default)]
    pub downloaded: BTreeMap<String, ModelInfo>,
}

/// Registry backed by a single JSON document
#[derive(Debug)]
pub struct JsonModelRegistry {
    doc: DocumentStore<Library>,
}

impl JsonModelRegistry {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Ok(Self {
            doc: DocumentStore::open(path)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            doc: DocumentStore::in_memory(),
        }
    }

    /// Add or replace a catalogue entry
    pub fn register_known(&self, entry: ModelInfo) -> Result<()> {
        self.doc.update(|lib| {
            lib.known.insert(entry.model_id.clone(), entry);
            Ok(())
        })
    }

    pub fn list_known(&self) -> Vec<ModelInfo> {
        self.doc.read(|lib| lib.known.values().cloned().collect())
    }
}

impl ModelRegistry for JsonModelRegistry {
    fn get_model_info(&self, model_id: &str) -> Result<ModelInfo> {
        self.doc
            .read(|lib| lib.downloaded.get(model_id).cloned())
            .ok_or_else(|| ModelPlayError::not_found(format!("model {} is not downloaded", model_id)))
    }

    fn known_model(&self, model_id: &str) -> Result<ModelInfo> {
        self.doc
            .read(|lib| lib.known.get(model_id).cloned())
            .ok_or_else(|| ModelPlayError::not_found(format!("unknown model {}", model_id)))
    }

    fn record_download(&self, model_id: &str, entry: ModelInfo) -> Result<()> {
        if entry.model_id != model_id {
            return Err(ModelPlayError::validation(format!(
                "download entry for {} recorded under {}",
                entry.model_id, model_id
            )));
        }
        self.doc.update(|lib| {
            lib.downloaded.insert(model_id.to_string(), entry);
            Ok(())
        })?;
        info!("Recorded download of {}", model_id);
        Ok(())
    }

    fn update_config(&self, model_id: &str, config: Value) -> Result<ModelInfo> {
        self.doc.update(|lib| {
            let entry = lib.downloaded.get_mut(model_id).ok_or_else(|| {
                ModelPlayError::not_found(format!("model {} is not downloaded", model_id))
            })?;
            entry.config = config;
            Ok(entry.clone())
        })
    }

    fn list_downloaded(&self) -> Vec<ModelInfo> {
        self.doc.read(|lib| lib.downloaded.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplay_proto::Modality;
    use serde_json::json;

    fn entry(id: &str) -> ModelInfo {
        ModelInfo {
            model_id: id.to_string(),
            construction_class: "echo".to_string(),
            storage_dir: PathBuf::from(format!("/models/{}", id)),
            modality: Modality::new("text", "text"),
            config: json!({}),
        }
    }

    #[test]
    fn test_known_is_not_loadable_until_downloaded() {
        let registry = JsonModelRegistry::in_memory();
        registry.register_known(entry("m")).unwrap();

        assert!(registry.known_model("m").is_ok());
        assert!(matches!(
            registry.get_model_info("m"),
            Err(ModelPlayError::NotFound(_))
        ));

        registry.record_download("m", entry("m")).unwrap();
        assert_eq!(registry.get_model_info("m").unwrap(), entry("m"));
    }

    #[test]
    fn test_update_config_requires_download() {
        let registry = JsonModelRegistry::in_memory();
        assert!(registry.update_config("m", json!({"x": 1})).is_err());

        registry.record_download("m", entry("m")).unwrap();
        let updated = registry.update_config("m", json!({"x": 1})).unwrap();
        assert_eq!(updated.config, json!({"x": 1}));
    }

    #[test]
    fn test_mismatched_download_entry_is_rejected() {
        let registry = JsonModelRegistry::in_memory();
        let err = registry.record_download("a", entry("b")).unwrap_err();
        assert!(matches!(err, ModelPlayError::Validation(_)));
    }
}
