//! ONNX Runtime backend
//!
//! A computation runs the whole graph on a worker thread and hands the
//! result back over a oneshot channel. Each step polls the channel without
//! blocking, so a run still takes an unknown number of ticks and the host
//! loop stays responsive. Outputs come back in host memory and download on
//! the first poll.
//!
//! A run cannot be interrupted once ort has it. Dropping the computation
//! mid-run detaches the worker, which keeps the session lock until the run
//! returns; the next run on that context waits for it.

use super::{
    Computation, Device, DeviceTensor, ExecutionContext, HostResidentTensor, InferenceBackend,
    StepStatus,
};
use gazeloop_core::{Error, HostTensor, Result};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Max elements accepted for a single input tensor.
const MAX_INPUT_ELEMENTS: usize = 100_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxBackend {
    intra_threads: Option<usize>,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads.max(1));
        self
    }
}

/// A model file that exists on disk; the session is created per context.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    path: PathBuf,
}

impl InferenceBackend for OnnxBackend {
    type Model = OnnxModel;

    fn load(&self, asset: &Path) -> Result<OnnxModel> {
        if !asset.is_file() {
            return Err(Error::ModelNotLoaded(format!("model file not found: {:?}", asset)));
        }
        Ok(OnnxModel {
            path: asset.to_path_buf(),
        })
    }

    fn create_context(&self, model: OnnxModel, device: Device) -> Result<Box<dyn ExecutionContext>> {
        let path = model.path.as_path();

        let mut builder = Session::builder()
            .map_err(|e| load_error(path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(path, e))?;

        if let Some(threads) = self.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(|e| load_error(path, e))?;
        }

        builder = match device {
            Device::GpuCompute => builder.with_execution_providers([
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ]),
            Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
        }
        .map_err(|e| load_error(path, e))?;

        let session = builder.commit_from_file(path).map_err(|e| load_error(path, e))?;

        let name = model
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model.path.display().to_string());
        info!("ONNX model {} loaded from {:?} on {:?}", name, model.path, device);

        Ok(Box::new(OnnxContext {
            name,
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

struct OnnxContext {
    name: String,
    session: Arc<Mutex<Session>>,
}

impl ExecutionContext for OnnxContext {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn schedule(&mut self, input: HostTensor) -> Result<Box<dyn Computation>> {
        if input.len() > MAX_INPUT_ELEMENTS {
            return Err(Error::InputUnavailable(format!(
                "input tensor too large ({} elements)",
                input.len()
            )));
        }

        Ok(Box::new(OnnxComputation {
            name: self.name.clone(),
            session: Arc::clone(&self.session),
            input: Some(input),
            worker: None,
            outputs: None,
        }))
    }
}

type RunResult = Result<Vec<HostTensor>>;

/// A run in flight on its own thread.
struct Worker {
    name: String,
    result: oneshot::Receiver<RunResult>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(name: &str, run: F) -> Result<Self>
    where
        F: FnOnce() -> RunResult + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = thread::Builder::new()
            .name(format!("gazeloop-onnx-{}", name))
            .spawn(move || {
                // receiver is gone when the computation was dropped mid-run
                let _ = tx.send(run());
            })
            .map_err(|e| Error::ComputationFailed(format!("{}: failed to start worker: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            result: rx,
            handle: Some(handle),
        })
    }

    /// `None` while the run is still going.
    fn poll(&mut self) -> Option<RunResult> {
        let result = match self.result.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(Error::ComputationFailed(format!(
                "{}: worker exited without a result",
                self.name
            ))),
        };
        self.join();
        Some(result)
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("ONNX worker for {} panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        match self.handle.take() {
            Some(handle) if handle.is_finished() => {
                let _ = handle.join();
            }
            Some(_) => debug!("ONNX run for {} detached; session stays locked until it returns", self.name),
            None => {}
        }
    }
}

struct OnnxComputation {
    name: String,
    session: Arc<Mutex<Session>>,
    input: Option<HostTensor>,
    worker: Option<Worker>,
    outputs: Option<Vec<Option<HostTensor>>>,
}

impl Computation for OnnxComputation {
    fn step(&mut self) -> Result<StepStatus> {
        if self.outputs.is_some() {
            return Ok(StepStatus::Complete);
        }

        if let Some(input) = self.input.take() {
            let session = Arc::clone(&self.session);
            self.worker = Some(Worker::spawn(&self.name, move || run_session(&session, input))?);
            debug!("ONNX run started for {}", self.name);
            return Ok(StepStatus::Pending);
        }

        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| Error::ComputationFailed(format!("{}: no run in progress", self.name)))?;

        match worker.poll() {
            None => Ok(StepStatus::Pending),
            Some(result) => {
                self.worker = None;
                let outputs = result?;
                debug!("ONNX run finished for {} with {} outputs", self.name, outputs.len());
                self.outputs = Some(outputs.into_iter().map(Some).collect());
                Ok(StepStatus::Complete)
            }
        }
    }

    fn output_count(&self) -> usize {
        self.outputs.as_ref().map_or(0, Vec::len)
    }

    fn take_output(&mut self, index: usize) -> Result<Box<dyn DeviceTensor>> {
        let outputs = self
            .outputs
            .as_mut()
            .ok_or_else(|| Error::ComputationFailed(format!("{}: computation has not finished", self.name)))?;
        let tensor = outputs
            .get_mut(index)
            .ok_or_else(|| Error::MalformedOutput(format!("{}: model has no output {}", self.name, index)))?
            .take()
            .ok_or_else(|| Error::Readback(format!("{}: output {} already taken", self.name, index)))?;
        Ok(Box::new(HostResidentTensor::new(tensor)))
    }
}

fn load_error(path: &Path, e: impl fmt::Display) -> Error {
    Error::ModelNotLoaded(format!("failed to load {:?}: {}", path, e))
}

fn inference_error(e: impl fmt::Display) -> Error {
    Error::ComputationFailed(format!("ONNX inference failed: {}", e))
}

fn run_session(session: &Mutex<Session>, input: HostTensor) -> RunResult {
    let shape = input.shape().to_vec();
    let value = Tensor::from_array((shape, input.into_vec())).map_err(inference_error)?;

    let mut session = session.lock();
    let outputs = session.run(ort::inputs![value]).map_err(inference_error)?;

    let mut tensors = Vec::with_capacity(outputs.len());
    for index in 0..outputs.len() {
        let (shape, data) = outputs[index].try_extract_tensor::<f32>().map_err(inference_error)?;
        let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
        tensors.push(HostTensor::new(dims, data.to_vec())?);
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn poll_until_done(worker: &mut Worker) -> RunResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = worker.poll() {
                return result;
            }
            assert!(Instant::now() < deadline, "worker never finished");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_worker_pending_until_run_returns() {
        let (release, gate) = mpsc::channel::<()>();
        let mut worker = Worker::spawn("gated", move || {
            let _ = gate.recv();
            Ok(vec![HostTensor::from_vec(vec![1.0, 2.0])])
        })
        .unwrap();

        assert!(worker.poll().is_none());
        assert!(worker.poll().is_none());

        release.send(()).unwrap();
        let outputs = poll_until_done(&mut worker).unwrap();
        assert_eq!(outputs[0].as_slice(), &[1.0, 2.0]);
        assert!(worker.handle.is_none());
    }

    #[test]
    fn test_worker_forwards_run_error() {
        let mut worker = Worker::spawn("failing", || Err(inference_error("bad input"))).unwrap();
        let err = poll_until_done(&mut worker).unwrap_err();
        assert!(matches!(err, Error::ComputationFailed(msg) if msg.contains("bad input")));
    }

    #[test]
    fn test_worker_panic_reported_as_failure() {
        let mut worker = Worker::spawn("panicking", || panic!("ort blew up")).unwrap();
        let err = poll_until_done(&mut worker).unwrap_err();
        assert!(matches!(err, Error::ComputationFailed(msg) if msg.contains("without a result")));
    }

    #[test]
    fn test_dropping_running_worker_does_not_block() {
        let (_release, gate) = mpsc::channel::<()>();
        let worker = Worker::spawn("detached", move || {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(Vec::new())
        })
        .unwrap();

        let started = Instant::now();
        drop(worker);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_missing_model_file() {
        let backend = OnnxBackend::new();
        let result = backend.load(Path::new("/no/such/model.onnx"));
        assert!(matches!(result, Err(Error::ModelNotLoaded(_))));
    }
}
