//! gazeloop-core: shared types for the gazeloop inference scheduler
//!
//! Holds the error taxonomy, the host-side tensor and the value types that
//! flow between the scheduler, its backends and presentation code.

pub mod error;
pub mod tensor;
pub mod types;

pub use error::{Error, Result};
pub use tensor::HostTensor;
pub use types::{AngleUnits, Detection, GazeEstimate, Region};
