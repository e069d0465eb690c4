//! IPC envelope types for supervisor ↔ worker communication.
//!
//! The protocol is strictly request/reply: the supervisor never sends a second
//! frame before the reply to the first one has arrived. The only unsolicited
//! frame is the handshake a worker emits once its model is loaded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work a request frame asks the worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Run the model on `data`.
    Inference,
    /// Merge `data` into the model config and reload the instance.
    Configure,
}

/// A single protocol frame, tagged on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Worker → supervisor, sent once after the model loaded.
    Handshake { model_id: String },

    /// Supervisor → worker: leave the request loop.
    Terminate,

    /// Worker → supervisor: acknowledgment of `Terminate`.
    Terminating,

    /// Supervisor → worker.
    Request {
        model_id: String,
        task: Task,
        data: Value,
    },

    /// Worker → supervisor: successful result of a request.
    Reply { data: Value },

    /// Worker → supervisor: the request (or handshake) failed.
    Error { message: String },
}

impl Envelope {
    pub fn inference(model_id: impl Into<String>, data: Value) -> Self {
        Envelope::Request {
            model_id: model_id.into(),
            task: Task::Inference,
            data,
        }
    }

    pub fn configure(model_id: impl Into<String>, config: Value) -> Self {
        Envelope::Request {
            model_id: model_id.into(),
            task: Task::Configure,
            data: config,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }

    /// Short name of the frame kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Handshake { .. } => "handshake",
            Envelope::Terminate => "terminate",
            Envelope::Terminating => "terminating",
            Envelope::Request { .. } => "request",
            Envelope::Reply { .. } => "reply",
            Envelope::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let env = Envelope::inference("t2t", json!({"payload": "hi"}));
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(
            value,
            json!({
                "kind": "request",
                "model_id": "t2t",
                "task": "inference",
                "data": {"payload": "hi"}
            })
        );
    }

    #[test]
    fn test_unit_variants_carry_only_kind() {
        let value = serde_json::to_value(Envelope::Terminate).unwrap();
        assert_eq!(value, json!({"kind": "terminate"}));

        let parsed: Envelope = serde_json::from_value(json!({"kind": "terminating"})).unwrap();
        assert_eq!(parsed, Envelope::Terminating);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed = serde_json::from_value::<Envelope>(json!({"kind": "pickle"}));
        assert!(parsed.is_err());
    }
}
