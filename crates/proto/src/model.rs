//! Model metadata shared by the supervisor and its workers

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Modality tag for plain text.
pub const TEXT: &str = "text";

/// Declared input/output modality of a model (e.g. `text` → `image`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modality {
    pub input: String,
    pub output: String,
}

impl Modality {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Whether the model consumes and produces text, i.e. may sit anywhere
    /// but last in a chain.
    pub fn is_text_to_text(&self) -> bool {
        self.input == TEXT && self.output == TEXT
    }
}

/// Registry entry describing how to construct a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Unique model identifier
    pub model_id: String,

    /// Name the worker's model factory resolves to a concrete model type
    pub construction_class: String,

    /// Where the model's files live
    pub storage_dir: PathBuf,

    /// Declared modality
    pub modality: Modality,

    /// Model-specific configuration (a JSON object)
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(Default::default())
}

/// Everything a worker process needs to construct and load its model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub model: ModelInfo,

    /// Device string handed to the model's `load`
    pub device: String,

    /// Maximum accepted frame size
    pub max_frame_bytes: usize,
}

impl LaunchSpec {
    pub fn model_id(&self) -> &str {
        &self.model.model_id
    }
}

/// Shallow merge of two model configs: keys of `patch` overwrite keys of
/// `base`. A non-object `base` is treated as empty.
pub fn merge_config(base: &Value, patch: &Map<String, Value>) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}
