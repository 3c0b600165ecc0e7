//! Detection relay
//!
//! Runs an object detector over a live video source and relays the results:
//! per-detection metadata goes to a key/value store with change
//! notifications, and the annotated video is re-encoded and pushed to a
//! streaming endpoint.
//!
//! # Architecture
//!
//! Capture and inference each block (device reads, model calls), so they run
//! on separate threads joined by bounded queues. A full queue drops frames
//! rather than stalling capture. The coordinator drains results in capture
//! order and fans them out to two best-effort sinks whose failures never stop
//! the pipeline.
//!
//! # Module Structure
//!
//! - `frame`: BGR24 frame container
//! - `queue`, `cancel`: bounded hand-off queues and the shared stop token
//! - `ingest`: frame sources (synthetic, ffmpeg-decoded devices, files, streams)
//! - `detect`: detector backends, detection records, overlay drawing
//! - `pipeline`: capture/inference stages and the coordinator
//! - `sink`: metadata publisher and stream re-encoder
//! - `config`: layered configuration

pub mod cancel;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod sink;

pub use cancel::StopToken;
pub use config::RelayConfig;
pub use detect::{
    open_backend, BoundingBox, ComputeDevice, DetectParams, Detection, DetectorBackend,
};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceSpec};
pub use pipeline::{Coordinator, InferenceResult, PipelineSummary};
pub use queue::OverflowPolicy;
pub use sink::{MetadataPublisher, StreamSink};
