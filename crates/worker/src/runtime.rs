//! Worker request loop
//!
//! A worker hosts exactly one model. It constructs and loads it, reports the
//! outcome with a single handshake frame, then answers requests one at a time
//! until told to terminate or until its command channel closes.

use crate::model::{Model, ModelFactory};
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_proto::{
    merge_config, read_frame, write_frame, Envelope, FrameError, LaunchSpec, ModelInfo, Task,
};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Run `f`, turning a panic into a model error
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ModelPlayError::model(format!("model panicked: {}", message)))
    })
}

fn construct(factory: &ModelFactory, info: &ModelInfo, device: &str) -> Result<Box<dyn Model>> {
    guarded(|| {
        let mut model = factory.build(info)?;
        model.load(device, info)?;
        Ok(model)
    })
}

fn merged(base: &Value, patch: &Value) -> Result<Value> {
    patch
        .as_object()
        .map(|patch| merge_config(base, patch))
        .ok_or_else(|| ModelPlayError::validation("configuration must be a JSON object"))
}

/// Loaded model plus the metadata it was built from
struct Hosted {
    info: ModelInfo,
    model: Box<dyn Model>,
}

impl Hosted {
    fn infer(&mut self, data: &Value) -> Envelope {
        match guarded(|| self.model.inference(data)) {
            Ok(result) => Envelope::Reply { data: result },
            Err(e) => {
                warn!("Inference failed on {}: {}", self.info.model_id, e);
                Envelope::error(e.to_string())
            }
        }
    }

    /// Rebuild the instance with merged config; keep the old one on failure
    fn reconfigure(&mut self, factory: &ModelFactory, device: &str, patch: &Value) -> Envelope {
        let rebuilt = merged(&self.info.config, patch).and_then(|config| {
            let info = ModelInfo {
                config,
                ..self.info.clone()
            };
            let model = construct(factory, &info, device)?;
            Ok((info, model))
        });

        match rebuilt {
            Ok((info, model)) => {
                info!("Reloaded {} with new configuration", info.model_id);
                let config = info.config.clone();
                self.info = info;
                self.model = model;
                Envelope::Reply { data: config }
            }
            Err(e) => {
                warn!("Reconfigure of {} failed, keeping previous instance: {}", self.info.model_id, e);
                Envelope::error(e.to_string())
            }
        }
    }
}

/// Serve one model over `reader`/`writer` until terminated.
///
/// Construction or load failures are reported as an error handshake and
/// returned to the caller.
pub async fn run_worker<R, W>(spec: LaunchSpec, factory: &ModelFactory, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let model_id = spec.model_id().to_string();
    info!("Worker for {} starting (class={}, device={})", model_id, spec.model.construction_class, spec.device);

    let model = match construct(factory, &spec.model, &spec.device) {
        Ok(model) => model,
        Err(e) => {
            error!("Failed to load {}: {}", model_id, e);
            write_frame(&mut writer, &Envelope::error(e.to_string())).await?;
            return Err(e);
        }
    };
    let mut hosted = Hosted {
        info: spec.model.clone(),
        model,
    };

    write_frame(&mut writer, &Envelope::Handshake { model_id: model_id.clone() }).await?;
    info!("Worker for {} ready", model_id);

    loop {
        let frame = match read_frame(&mut reader, spec.max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Command channel closed, worker for {} exiting", model_id);
                return Ok(());
            }
            // body was fully consumed, the stream is still aligned
            Err(FrameError::Malformed(e)) => {
                warn!("Discarding malformed frame: {}", e);
                write_frame(&mut writer, &Envelope::error(format!("malformed frame: {}", e))).await?;
                continue;
            }
            // oversized body was skipped by the codec
            Err(e @ FrameError::TooLarge { .. }) => {
                warn!("Discarding oversized frame: {}", e);
                write_frame(&mut writer, &Envelope::error(e.to_string())).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Worker for {} received {} frame", model_id, frame.kind());

        let reply = match frame {
            Envelope::Terminate => {
                write_frame(&mut writer, &Envelope::Terminating).await?;
                info!("Worker for {} terminating", model_id);
                return Ok(());
            }
            Envelope::Request { model_id: target, .. } if target != model_id => {
                Envelope::error(format!("request for {} sent to worker hosting {}", target, model_id))
            }
            Envelope::Request { task: Task::Inference, data, .. } => hosted.infer(&data),
            Envelope::Request { task: Task::Configure, data, .. } => {
                hosted.reconfigure(factory, &spec.device, &data)
            }
            other => Envelope::error(format!("unexpected {} frame", other.kind())),
        };

        write_frame(&mut writer, &reply).await?;
    }
}

/// Download the model described by `spec` and report the resulting
/// registry entry in a single frame.
pub async fn run_download<W>(spec: LaunchSpec, factory: &ModelFactory, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!("Downloading {} into {}", spec.model_id(), spec.model.storage_dir.display());

    let outcome = guarded(|| factory.build(&spec.model)?.download(&spec.model))
        .and_then(|entry| Ok(serde_json::to_value(entry)?));

    let frame = match &outcome {
        Ok(entry) => Envelope::Reply { data: entry.clone() },
        Err(e) => {
            error!("Download of {} failed: {}", spec.model_id(), e);
            Envelope::error(e.to_string())
        }
    };
    write_frame(&mut writer, &frame).await?;

    outcome.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplay_proto::{Modality, DEFAULT_MAX_FRAME_BYTES};
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::io::{duplex, DuplexStream};

    fn spec(class: &str) -> LaunchSpec {
        LaunchSpec {
            model: ModelInfo {
                model_id: "m".to_string(),
                construction_class: class.to_string(),
                storage_dir: PathBuf::from("/tmp/m"),
                modality: Modality::new("text", "text"),
                config: json!({}),
            },
            device: "cpu".to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
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

    struct Harness {
        to_worker: DuplexStream,
        from_worker: DuplexStream,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(spec: LaunchSpec, factory: ModelFactory) -> Self {
            let (to_worker, worker_in) = duplex(4096);
            let (worker_out, from_worker) = duplex(4096);
            let task = tokio::spawn(async move { run_worker(spec, &factory, worker_in, worker_out).await });
            Self {
                to_worker,
                from_worker,
                task,
            }
        }

        async fn recv(&mut self) -> Envelope {
            read_frame(&mut self.from_worker, DEFAULT_MAX_FRAME_BYTES)
                .await
                .unwrap()
                .unwrap()
        }

        async fn call(&mut self, envelope: Envelope) -> Envelope {
            write_frame(&mut self.to_worker, &envelope).await.unwrap();
            self.recv().await
        }
    }

    #[tokio::test]
    async fn test_handshake_then_inference_then_terminate() {
        let mut h = Harness::start(spec("uppercase"), ModelFactory::with_builtin());

        assert_eq!(h.recv().await, Envelope::Handshake { model_id: "m".to_string() });

        let reply = h.call(Envelope::inference("m", json!({"payload": "hi"}))).await;
        assert_eq!(reply, Envelope::Reply { data: json!("HI") });

        assert_eq!(h.call(Envelope::Terminate).await, Envelope::Terminating);
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_class_fails_handshake() {
        let mut h = Harness::start(spec("nope"), ModelFactory::with_builtin());

        assert!(matches!(h.recv().await, Envelope::Error { .. }));
        assert!(h.task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_panic_becomes_error_envelope_and_loop_survives() {
        let mut factory = ModelFactory::with_builtin();
        factory.register("panicky", |_| Ok(Box::new(PanickyModel)));
        let mut h = Harness::start(spec("panicky"), factory);
        h.recv().await;

        let reply = h.call(Envelope::inference("m", json!({}))).await;
        match reply {
            Envelope::Error { message } => assert!(message.contains("tensor shape mismatch")),
            other => panic!("expected error envelope, got {:?}", other),
        }

        assert_eq!(h.call(Envelope::Terminate).await, Envelope::Terminating);
    }

    #[tokio::test]
    async fn test_configure_reloads_with_merged_config() {
        let mut h = Harness::start(spec("uppercase"), ModelFactory::with_builtin());
        h.recv().await;

        let reply = h.call(Envelope::configure("m", json!({"suffix": "?"}))).await;
        assert_eq!(reply, Envelope::Reply { data: json!({"suffix": "?"}) });

        let reply = h.call(Envelope::inference("m", json!({"payload": "ok"}))).await;
        assert_eq!(reply, Envelope::Reply { data: json!("OK?") });

        let reply = h.call(Envelope::configure("m", json!("not-an-object"))).await;
        assert!(matches!(reply, Envelope::Error { .. }));

        // previous instance still serving
        let reply = h.call(Envelope::inference("m", json!({"payload": "ok"}))).await;
        assert_eq!(reply, Envelope::Reply { data: json!("OK?") });
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_and_loop_survives() {
        let mut small = spec("echo");
        small.max_frame_bytes = 256;
        let mut h = Harness::start(small, ModelFactory::with_builtin());
        h.recv().await;

        let reply = h
            .call(Envelope::inference("m", json!({"payload": "x".repeat(2048)})))
            .await;
        match reply {
            Envelope::Error { message } => assert!(message.contains("exceeds limit")),
            other => panic!("expected error envelope, got {:?}", other),
        }

        let reply = h.call(Envelope::inference("m", json!({"payload": "ok"}))).await;
        assert_eq!(reply, Envelope::Reply { data: json!({"payload": "ok"}) });
    }

    #[tokio::test]
    async fn test_closed_channel_ends_loop() {
        let mut h = Harness::start(spec("echo"), ModelFactory::with_builtin());
        h.recv().await;

        drop(h.to_worker);
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_misaddressed_request_is_rejected() {
        let mut h = Harness::start(spec("echo"), ModelFactory::with_builtin());
        h.recv().await;

        let reply = h.call(Envelope::inference("other", json!({}))).await;
        assert!(matches!(reply, Envelope::Error { .. }));
    }

    #[tokio::test]
    async fn test_download_reports_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("echo");
        spec.model.storage_dir = dir.path().join("m");
        let (mut out, mut from_worker) = duplex(4096);

        run_download(spec.clone(), &ModelFactory::with_builtin(), &mut out)
            .await
            .unwrap();

        let frame = read_frame(&mut from_worker, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let data = match frame {
            Envelope::Reply { data } => data,
            other => panic!("expected reply, got {:?}", other),
        };
        let entry: ModelInfo = serde_json::from_value(data).unwrap();
        assert_eq!(entry, spec.model);
    }
}
