//! Worker process launching
//!
//! The supervisor never touches `std::process` directly; it asks a
//! [`WorkerLauncher`] for a duplex channel plus a handle on whatever hosts
//! the worker. The production launcher spawns the `modelplay-worker`
//! executable with piped stdin/stdout.

use async_trait::async_trait;
use modelplay_common::error::{ModelPlayError, Result};
use modelplay_proto::LaunchSpec;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle on the thing hosting a worker (normally an OS process)
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if there is one
    fn id(&self) -> Option<u32>;

    /// Liveness probe; must not block
    fn is_alive(&mut self) -> bool;

    /// Ask the host to die without waiting for it
    fn start_kill(&mut self) -> std::io::Result<()>;

    /// Wait until the host has exited and been reaped
    async fn wait(&mut self) -> std::io::Result<()>;
}

/// Both pipe ends of a freshly started worker plus its process handle
pub struct WorkerChannel {
    /// Frames from the worker
    pub reader: BoxedReader,
    /// Frames to the worker
    pub writer: BoxedWriter,
    pub process: Box<dyn WorkerProcess>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Starts worker hosts
pub trait WorkerLauncher: Send + Sync {
    /// Start a long-lived worker serving `spec.model`
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerChannel>;

    /// Start a throwaway worker that downloads `spec.model` and exits
    fn launch_download(&self, spec: &LaunchSpec) -> Result<WorkerChannel>;
}

/// A tokio child process
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for OsProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        let status = self.child.wait().await?;
        debug!("Worker process exited with {}", status);
        Ok(())
    }
}

/// Spawns the worker executable
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn spawn(&self, spec: &LaunchSpec, download: bool) -> Result<WorkerChannel> {
        let spec_json = serde_json::to_string(spec)?;

        let mut command = Command::new(&self.binary);
        command.arg("--spec").arg(spec_json);
        if download {
            command.arg("--download");
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // worker logs go to our stderr
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ModelPlayError::transport(format!(
                    "failed to spawn {} for {}: {}",
                    self.binary.display(),
                    spec.model_id(),
                    e
                ))
            })?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| ModelPlayError::internal("worker stdin not captured"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| ModelPlayError::internal("worker stdout not captured"))?;

        info!(
            "Spawned worker pid={:?} for {}{}",
            child.id(),
            spec.model_id(),
            if download { " (download)" } else { "" }
        );

        Ok(WorkerChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(OsProcess { child }),
        })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerChannel> {
        self.spawn(spec, false)
    }

    fn launch_download(&self, spec: &LaunchSpec) -> Result<WorkerChannel> {
        self.spawn(spec, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplay_proto::{Modality, ModelInfo};

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let launcher = ProcessLauncher::new("/nonexistent/modelplay-worker");
        let spec = LaunchSpec {
            model: ModelInfo {
                model_id: "m".to_string(),
                construction_class: "echo".to_string(),
                storage_dir: PathBuf::from("/tmp/m"),
                modality: Modality::new("text", "text"),
                config: serde_json::json!({}),
            },
            device: "cpu".to_string(),
            max_frame_bytes: 1024,
        };

        let err = launcher.launch(&spec).unwrap_err();
        assert!(matches!(err, ModelPlayError::Transport(_)));
    }
}
