//! Inference backend capability
//!
//! The scheduler never runs a network itself. It talks to a backend through
//! these traits: a backend loads models and creates execution contexts, a
//! context schedules a resumable [`Computation`] for one input tensor, and a
//! finished computation hands out [`DeviceTensor`]s that can be downloaded
//! to host memory through a pollable [`PendingDownload`].

pub mod simulated;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use simulated::{ModelScript, OutputScript, SimulatedBackend};
#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

use gazeloop_core::{HostTensor, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where a backend should place model execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// GPU compute shaders / accelerator
    GpuCompute,
    Cpu,
}

/// Result of a single atomic step of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More steps remain.
    Pending,
    /// The step just taken was the last one; outputs are available.
    Complete,
}

/// A resumable unit of work bound to one model and one input.
pub trait Computation: Send {
    /// Perform exactly one internal step.
    fn step(&mut self) -> Result<StepStatus>;

    /// Number of output slots the model produces.
    fn output_count(&self) -> usize;

    /// Move output `index` out of a completed computation.
    ///
    /// Each output can be taken once.
    fn take_output(&mut self, index: usize) -> Result<Box<dyn DeviceTensor>>;
}

/// Tensor owned by the backend (possibly in accelerator memory).
pub trait DeviceTensor: Send {
    fn shape(&self) -> &[usize];

    /// `false` when the computation produced no backing data for this output.
    fn is_realized(&self) -> bool;

    fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Begin the transfer to host memory, giving up the device tensor.
    fn download(self: Box<Self>) -> Box<dyn PendingDownload>;
}

/// In-flight host transfer.
pub trait PendingDownload: Send {
    /// Non-blocking; `Some` once the host copy is available.
    fn poll(&mut self) -> Result<Option<HostTensor>>;
}

/// A loaded model bound to a device, able to schedule computations.
pub trait ExecutionContext: Send {
    fn model_name(&self) -> &str;

    fn schedule(&mut self, input: HostTensor) -> Result<Box<dyn Computation>>;
}

/// Model loading capability.
pub trait InferenceBackend {
    type Model;

    fn load(&self, asset: &Path) -> Result<Self::Model>;

    fn create_context(&self, model: Self::Model, device: Device) -> Result<Box<dyn ExecutionContext>>;
}

/// Device tensor whose data already lives in host memory.
///
/// Used by backends that compute on the CPU; the download completes on the
/// first poll.
pub struct HostResidentTensor {
    tensor: HostTensor,
}

impl HostResidentTensor {
    pub fn new(tensor: HostTensor) -> Self {
        Self { tensor }
    }
}

impl DeviceTensor for HostResidentTensor {
    fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    fn is_realized(&self) -> bool {
        !self.tensor.is_empty()
    }

    fn download(self: Box<Self>) -> Box<dyn PendingDownload> {
        Box::new(ImmediateDownload {
            tensor: Some(self.tensor),
        })
    }
}

struct ImmediateDownload {
    tensor: Option<HostTensor>,
}

impl PendingDownload for ImmediateDownload {
    fn poll(&mut self) -> Result<Option<HostTensor>> {
        Ok(self.tensor.take())
    }
}

pub(crate) fn load_context<B: InferenceBackend>(
    backend: &B,
    asset: &Path,
    device: Device,
) -> Result<Box<dyn ExecutionContext>> {
    let model = backend.load(asset)?;
    backend.create_context(model, device)
}
