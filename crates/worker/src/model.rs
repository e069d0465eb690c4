//! Model abstraction hosted by a worker process
//!
//! Concrete model families live outside this crate; they plug in by
//! registering a constructor under a construction class name. A few
//! lightweight reference classes ship built in so a worker is usable
//! without any external model code.

use modelplay_common::error::{ModelPlayError, Result};
use modelplay_proto::ModelInfo;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A loadable model instance
pub trait Model: Send {
    /// Bring weights/resources into memory on `device`.
    fn load(&mut self, device: &str, metadata: &ModelInfo) -> Result<()>;

    /// Run the model on one request payload.
    fn inference(&mut self, data: &Value) -> Result<Value>;

    /// Fetch the model's files into `target.storage_dir` and return the
    /// registry entry describing the downloaded copy.
    fn download(&self, target: &ModelInfo) -> Result<ModelInfo> {
        std::fs::create_dir_all(&target.storage_dir)?;
        let manifest = target.storage_dir.join("config.json");
        std::fs::write(&manifest, serde_json::to_vec_pretty(&target.config)?)?;
        info!("Wrote model manifest {}", manifest.display());
        Ok(target.clone())
    }
}

/// Builds an unloaded model instance from its registry entry
pub type Constructor = Arc<dyn Fn(&ModelInfo) -> Result<Box<dyn Model>> + Send + Sync>;

/// Construction class → constructor
#[derive(Clone, Default)]
pub struct ModelFactory {
    constructors: HashMap<String, Constructor>,
}

impl std::fmt::Debug for ModelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classes: Vec<_> = self.constructors.keys().collect();
        classes.sort();
        f.debug_struct("ModelFactory").field("classes", &classes).finish()
    }
}

impl ModelFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the reference classes registered
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(EchoModel::CLASS, |_| Ok(Box::new(EchoModel)));
        factory.register(UppercaseModel::CLASS, |info| {
            Ok(Box::new(UppercaseModel::from_config(&info.config)))
        });
        factory.register(PixelSinkModel::CLASS, |_| Ok(Box::new(PixelSinkModel::default())));
        factory
    }

    /// Register (or replace) a construction class
    pub fn register<F>(&mut self, class: impl Into<String>, constructor: F)
    where
        F: Fn(&ModelInfo) -> Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.constructors.insert(class.into(), Arc::new(constructor));
    }

    /// Construct an unloaded instance for `info`
    pub fn build(&self, info: &ModelInfo) -> Result<Box<dyn Model>> {
        let constructor = self.constructors.get(&info.construction_class).ok_or_else(|| {
            ModelPlayError::model(format!(
                "unknown construction class '{}' for model {}",
                info.construction_class, info.model_id
            ))
        })?;
        debug!("Constructing {} as {}", info.model_id, info.construction_class);
        constructor(info)
    }
}

/// Extract the text `payload` field every text-consuming model expects
pub fn payload_text(data: &Value) -> Result<&str> {
    data.get("payload")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelPlayError::validation("request data must carry a string 'payload'"))
}

/// Returns its input unchanged
#[derive(Debug, Default)]
pub struct EchoModel;

impl EchoModel {
    pub const CLASS: &'static str = "echo";
}

impl Model for EchoModel {
    fn load(&mut self, _device: &str, _metadata: &ModelInfo) -> Result<()> {
        Ok(())
    }

    fn inference(&mut self, data: &Value) -> Result<Value> {
        Ok(data.clone())
    }
}

/// text → text: upper-cases the payload, appending the configured `suffix`
#[derive(Debug, Default)]
pub struct UppercaseModel {
    suffix: String,
    loaded: bool,
}

impl UppercaseModel {
    pub const CLASS: &'static str = "uppercase";

    pub fn from_config(config: &Value) -> Self {
        Self {
            suffix: config
                .get("suffix")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            loaded: false,
        }
    }
}

impl Model for UppercaseModel {
    fn load(&mut self, device: &str, metadata: &ModelInfo) -> Result<()> {
        debug!("{} loading on {}", metadata.model_id, device);
        self.loaded = true;
        Ok(())
    }

    fn inference(&mut self, data: &Value) -> Result<Value> {
        if !self.loaded {
            return Err(ModelPlayError::model("model used before load"));
        }
        let text = payload_text(data)?;
        Ok(Value::String(format!("{}{}", text.to_uppercase(), self.suffix)))
    }
}

/// text → image: renders the payload bytes as a one-row grayscale image
#[derive(Debug, Default)]
pub struct PixelSinkModel;

impl PixelSinkModel {
    pub const CLASS: &'static str = "pixel-sink";
}

impl Model for PixelSinkModel {
    fn load(&mut self, _device: &str, _metadata: &ModelInfo) -> Result<()> {
        Ok(())
    }

    fn inference(&mut self, data: &Value) -> Result<Value> {
        let text = payload_text(data)?;
        let pixels: Vec<u8> = text.bytes().collect();
        Ok(json!({
            "format": "gray8",
            "width": pixels.len(),
            "height": 1,
            "pixels": pixels,
            "prompt": text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplay_proto::Modality;
    use std::path::PathBuf;

    fn info(class: &str, config: Value) -> ModelInfo {
        ModelInfo {
            model_id: format!("{}-model", class),
            construction_class: class.to_string(),
            storage_dir: PathBuf::from("/tmp/unused"),
            modality: Modality::new("text", "text"),
            config,
        }
    }

    #[test]
    fn test_unknown_class_is_a_model_error() {
        let factory = ModelFactory::with_builtin();
        let err = factory.build(&info("diffusion-xl", json!({}))).err().unwrap();
        assert!(matches!(err, ModelPlayError::Model(msg) if msg.contains("diffusion-xl")));
    }

    #[test]
    fn test_uppercase_applies_suffix() {
        let factory = ModelFactory::with_builtin();
        let meta = info("uppercase", json!({"suffix": "!"}));
        let mut model = factory.build(&meta).unwrap();
        model.load("cpu", &meta).unwrap();

        let out = model.inference(&json!({"payload": "hi"})).unwrap();
        assert_eq!(out, json!("HI!"));
    }

    #[test]
    fn test_missing_payload_is_validation_error() {
        let mut model = PixelSinkModel;
        let err = model.inference(&json!({"text": "hi"})).unwrap_err();
        assert!(matches!(err, ModelPlayError::Validation(_)));
    }

    #[test]
    fn test_default_download_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = info("echo", json!({"revision": "main"}));
        target.storage_dir = dir.path().join("echo");

        let entry = EchoModel.download(&target).unwrap();

        assert_eq!(entry, target);
        let written = std::fs::read_to_string(dir.path().join("echo/config.json")).unwrap();
        assert!(written.contains("main"));
    }
}
