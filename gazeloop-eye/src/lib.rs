//! gazeloop-eye: frame-amortized gaze inference
//!
//! Runs a coarse face detector and a gaze regressor over camera frames
//! without ever blocking the host loop. Model execution is advanced a bounded
//! number of steps per tick and tensor readbacks are polled rather than
//! awaited, so the cost of one detection cycle is spread over many frames.

pub mod backend;
pub mod config;
pub mod decoder;
pub mod executor;
pub mod frame;
pub mod pipeline;
pub mod readback;
pub mod smoothing;
pub mod status;

pub use backend::{Device, InferenceBackend, SimulatedBackend};
pub use config::GazeConfig;
pub use decoder::DetectionDecoder;
pub use executor::{Advance, StepLimitedExecutor};
pub use frame::{FrameSource, ImageFrame};
pub use pipeline::{CycleStart, GazePipeline, PipelinePhase};
pub use readback::{ReadbackChannel, ReadbackPhase};
pub use smoothing::{GazeSmoother, SmoothingState};
pub use status::{MemoryStatusSink, NullStatusSink, StatusSink, TracingStatusSink};
