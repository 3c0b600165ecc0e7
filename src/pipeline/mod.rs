//! Two-stage capture/inference pipeline.
//!
//! ```text
//! FrameSource -> capture thread -> frame queue -> inference thread
//!             -> result queue -> coordinator -> {metadata, stream}
//! ```
//!
//! The stages run on their own OS threads and share nothing but the two
//! bounded queues and the stop token. Errors never cross a stage boundary:
//! they end up as stop-token state, counters, or sink return values.

mod capture;
mod coordinator;
mod inference;
mod stats;

pub use capture::{run_capture, spawn_capture, CaptureReport};
pub use coordinator::Coordinator;
pub use inference::{spawn_inference, InferenceReport, InferenceResult, InferenceStage};
pub use stats::{PipelineStats, PipelineSummary};

/// Why a stage thread returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageExit {
    /// The stop token was observed.
    Stopped,
    /// Input was exhausted (source end of stream, or frame queue closed and drained).
    EndOfStream,
    /// The downstream queue consumer went away.
    DownstreamClosed,
    /// Fatal-to-stage error; the stop token was cancelled.
    Failed(String),
}
