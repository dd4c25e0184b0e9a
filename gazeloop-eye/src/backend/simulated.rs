//! Deterministic in-process backend
//!
//! Models are scripted by asset path: how many steps a computation takes,
//! whether (and where) it fails, and what each output slot contains. The
//! backend keeps a registry of live computations and device tensors so
//! callers can verify that every resource is released.

use super::{
    Computation, DeviceTensor, Device, ExecutionContext, InferenceBackend, PendingDownload,
    StepStatus,
};
use gazeloop_core::{Error, HostTensor, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Produces an output buffer from the computation's input tensor.
pub type OutputFn = Arc<dyn Fn(&HostTensor) -> Vec<f32> + Send + Sync>;

#[derive(Clone)]
enum OutputData {
    Fixed(Vec<f32>),
    Computed(OutputFn),
}

/// Script for one output slot.
#[derive(Clone)]
pub struct OutputScript {
    data: OutputData,
    /// Polls that return "not ready" before the download completes; `None` never completes.
    latency_polls: Option<u32>,
    realized: bool,
    /// Shape the device tensor reports; defaults to the data length.
    shape: Option<Vec<usize>>,
}

impl OutputScript {
    pub fn fixed(values: Vec<f32>) -> Self {
        Self {
            data: OutputData::Fixed(values),
            latency_polls: Some(0),
            realized: true,
            shape: None,
        }
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&HostTensor) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            data: OutputData::Computed(Arc::new(f)),
            latency_polls: Some(0),
            realized: true,
            shape: None,
        }
    }

    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency_polls = Some(polls);
        self
    }

    /// Download never completes.
    pub fn never_ready(mut self) -> Self {
        self.latency_polls = None;
        self
    }

    /// Output has no backing data.
    pub fn unrealized(mut self) -> Self {
        self.realized = false;
        self
    }

    /// Report `shape` on the device tensor whatever the data turns out to be.
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    fn materialize(&self, input: &HostTensor) -> Vec<f32> {
        match &self.data {
            OutputData::Fixed(values) => values.clone(),
            OutputData::Computed(f) => f(input),
        }
    }
}

/// Script for one model.
#[derive(Clone)]
pub struct ModelScript {
    steps: usize,
    fail_at_step: Option<usize>,
    outputs: Vec<OutputScript>,
}

impl ModelScript {
    /// A model whose graph takes `steps` atomic steps (at least one).
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            fail_at_step: None,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: OutputScript) -> Self {
        self.outputs.push(output);
        self
    }

    /// Raise a failure on the given (1-based) step.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[derive(Default)]
struct Registry {
    live_computations: AtomicUsize,
    live_tensors: AtomicUsize,
    scheduled: AtomicUsize,
}

/// Decrements its counter when dropped.
struct LiveGuard {
    counter: Arc<Registry>,
    kind: GuardKind,
}

#[derive(Clone, Copy)]
enum GuardKind {
    Computation,
    Tensor,
}

impl LiveGuard {
    fn new(registry: &Arc<Registry>, kind: GuardKind) -> Self {
        match kind {
            GuardKind::Computation => registry.live_computations.fetch_add(1, Ordering::SeqCst),
            GuardKind::Tensor => registry.live_tensors.fetch_add(1, Ordering::SeqCst),
        };
        Self {
            counter: Arc::clone(registry),
            kind,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        match self.kind {
            GuardKind::Computation => self.counter.live_computations.fetch_sub(1, Ordering::SeqCst),
            GuardKind::Tensor => self.counter.live_tensors.fetch_sub(1, Ordering::SeqCst),
        };
    }
}

struct Shared {
    scripts: RwLock<HashMap<String, ModelScript>>,
    registry: Arc<Registry>,
}

/// Scripted backend. Cloning shares scripts and the resource registry.
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: RwLock::new(HashMap::new()),
                registry: Arc::new(Registry::default()),
            }),
        }
    }

    /// Register or replace the script for an asset path.
    ///
    /// Replacing a script affects computations scheduled afterwards.
    pub fn set_script(&self, asset: impl AsRef<Path>, script: ModelScript) {
        let key = asset_key(asset.as_ref());
        self.shared.scripts.write().insert(key, script);
    }

    pub fn remove_script(&self, asset: impl AsRef<Path>) {
        let key = asset_key(asset.as_ref());
        self.shared.scripts.write().remove(&key);
    }

    pub fn live_computations(&self) -> usize {
        self.shared.registry.live_computations.load(Ordering::SeqCst)
    }

    pub fn live_tensors(&self) -> usize {
        self.shared.registry.live_tensors.load(Ordering::SeqCst)
    }

    /// Total computations scheduled since creation.
    pub fn scheduled(&self) -> usize {
        self.shared.registry.scheduled.load(Ordering::SeqCst)
    }
}

fn asset_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Handle returned by [`SimulatedBackend::load`].
pub struct SimulatedModel {
    name: String,
}

impl InferenceBackend for SimulatedBackend {
    type Model = SimulatedModel;

    fn load(&self, asset: &Path) -> Result<SimulatedModel> {
        let key = asset_key(asset);
        if !self.shared.scripts.read().contains_key(&key) {
            return Err(Error::ModelNotLoaded(format!("no simulated model registered for {}", key)));
        }
        debug!("Simulated model {} loaded", key);
        Ok(SimulatedModel { name: key })
    }

    fn create_context(&self, model: SimulatedModel, device: Device) -> Result<Box<dyn ExecutionContext>> {
        debug!("Simulated context for {} on {:?}", model.name, device);
        Ok(Box::new(SimulatedContext {
            name: model.name,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SimulatedContext {
    name: String,
    shared: Arc<Shared>,
}

impl ExecutionContext for SimulatedContext {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn schedule(&mut self, input: HostTensor) -> Result<Box<dyn Computation>> {
        let script = self
            .shared
            .scripts
            .read()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| Error::ModelNotLoaded(format!("simulated model {} was removed", self.name)))?;

        self.shared.registry.scheduled.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedComputation {
            script,
            input,
            steps_done: 0,
            outputs: None,
            registry: Arc::clone(&self.shared.registry),
            _guard: LiveGuard::new(&self.shared.registry, GuardKind::Computation),
        }))
    }
}

struct SimulatedComputation {
    script: ModelScript,
    input: HostTensor,
    steps_done: usize,
    outputs: Option<Vec<Option<SimulatedTensor>>>,
    registry: Arc<Registry>,
    _guard: LiveGuard,
}

impl Computation for SimulatedComputation {
    fn step(&mut self) -> Result<StepStatus> {
        if self.outputs.is_some() {
            return Ok(StepStatus::Complete);
        }

        self.steps_done += 1;
        if self.script.fail_at_step == Some(self.steps_done) {
            return Err(Error::ComputationFailed(format!(
                "simulated failure at step {}",
                self.steps_done
            )));
        }

        if self.steps_done < self.script.steps {
            return Ok(StepStatus::Pending);
        }

        let outputs = self
            .script
            .outputs
            .iter()
            .map(|output| {
                let data = if output.realized {
                    output.materialize(&self.input)
                } else {
                    Vec::new()
                };
                Some(SimulatedTensor {
                    shape: output.shape.clone().unwrap_or_else(|| vec![data.len()]),
                    data,
                    realized: output.realized,
                    latency_polls: output.latency_polls,
                    _guard: LiveGuard::new(&self.registry, GuardKind::Tensor),
                })
            })
            .collect();
        self.outputs = Some(outputs);
        Ok(StepStatus::Complete)
    }

    fn output_count(&self) -> usize {
        self.script.outputs.len()
    }

    fn take_output(&mut self, index: usize) -> Result<Box<dyn DeviceTensor>> {
        let outputs = self
            .outputs
            .as_mut()
            .ok_or_else(|| Error::ComputationFailed("computation has not finished".to_string()))?;
        let slot = outputs
            .get_mut(index)
            .ok_or_else(|| Error::MalformedOutput(format!("model has no output {}", index)))?;
        let tensor = slot
            .take()
            .ok_or_else(|| Error::Readback(format!("output {} already taken", index)))?;
        Ok(Box::new(tensor))
    }
}

struct SimulatedTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    realized: bool,
    latency_polls: Option<u32>,
    _guard: LiveGuard,
}

impl DeviceTensor for SimulatedTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn is_realized(&self) -> bool {
        self.realized
    }

    fn download(self: Box<Self>) -> Box<dyn PendingDownload> {
        let tensor = *self;
        Box::new(SimulatedDownload {
            remaining: tensor.latency_polls,
            data: Some(tensor.data),
            guard: Some(tensor._guard),
        })
    }
}

struct SimulatedDownload {
    remaining: Option<u32>,
    data: Option<Vec<f32>>,
    guard: Option<LiveGuard>,
}

impl PendingDownload for SimulatedDownload {
    fn poll(&mut self) -> Result<Option<HostTensor>> {
        match self.remaining {
            None => Ok(None),
            Some(0) => {
                // device copy is released once the host copy exists
                self.guard = None;
                Ok(self.data.take().map(HostTensor::from_vec))
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                Ok(None)
            }
        }
    }
}
