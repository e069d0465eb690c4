//! ModelPlay Worker
//!
//! One worker process hosts exactly one loaded model and answers framed
//! requests from the supervisor over its stdin/stdout pipes.

pub mod model;
pub mod runtime;

pub use model::{Constructor, Model, ModelFactory};
pub use runtime::{run_download, run_worker};
