//! ModelPlay wire protocol
//!
//! Types exchanged between the supervisor and its model workers, and the
//! frame codec carrying them over a worker's stdin/stdout pipes.

pub mod codec;
pub mod envelope;
pub mod model;

pub use codec::{encode_frame, read_frame, write_encoded, write_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use envelope::{Envelope, Task};
pub use model::{merge_config, LaunchSpec, Modality, ModelInfo, TEXT};
