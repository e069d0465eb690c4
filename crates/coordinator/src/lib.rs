//! ModelPlay Coordinator
//!
//! Supervises one worker process per loaded model and composes loaded models
//! into playground chains.

pub mod chain;
pub mod hub;
pub mod launcher;
pub mod playground;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod usage;

pub use chain::{ChainExecutor, RecoveryReport};
pub use hub::Hub;
pub use launcher::{ProcessLauncher, WorkerChannel, WorkerLauncher, WorkerProcess};
pub use playground::{Playground, PlaygroundStore, PlaygroundUpdate};
pub use registry::{JsonModelRegistry, ModelRegistry};
pub use supervisor::{ProcessSupervisor, Release, SupervisorSettings, WorkerState};
pub use usage::UsageTracker;
