//! Face tracking and session state engine.
//!
//! Merges raw detections, follows faces across frames, resolves them to the
//! users of the active session and drives the serving state machine that
//! decides who is being followed. Embeddings come from a FaceNet-style model
//! running via ONNX Runtime.

pub mod embedder;
pub mod events;
pub mod identity;
pub mod liveness;
pub mod merger;
pub mod pipeline;
pub mod session;
pub mod signals;
pub mod tracker;
pub mod types;

pub use events::{EndReason, Event, EventSink};
pub use identity::{Embedder, EmbeddingStore, IdentityResolver};
pub use pipeline::{FacePipeline, FrameInput, PipelineConfig};
pub use signals::{Ack, Mode, Signal, SignalError};
pub use types::{BoundingBox, Embedding, EnrolledFace, Point};
