//! Two-stage gaze pipeline
//!
//! [`GazePipeline`] is ticked by the host loop. Each tick it moves the
//! current detection cycle forward as far as the bounded per-tick work
//! allows: every model is advanced at most once (by `steps_per_tick`
//! steps) and every readback is polled at most once. Cycle progress lives
//! in a single [`PipelineState`] value that owns every computation, frame
//! and host tensor of the cycle, so dropping the state releases them.

use crate::backend::{self, ExecutionContext, InferenceBackend};
use crate::config::GazeConfig;
use crate::decoder::DetectionDecoder;
use crate::executor::{Advance, StepLimitedExecutor};
use crate::frame::FrameSource;
use crate::readback::ReadbackChannel;
use crate::smoothing::{GazeSmoother, SmoothingState};
use crate::status::StatusSink;
use gazeloop_core::{AngleUnits, Detection, Error, GazeEstimate, HostTensor, Region, Result};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coarse detector output holding detection records.
pub const COORD_OUTPUT: usize = 0;
/// Coarse detector output holding label ids.
pub const LABEL_OUTPUT: usize = 1;
/// Gaze model output holding `[yaw, pitch]`.
pub const GAZE_OUTPUT: usize = 0;

/// Upper bound on state transitions in one tick; one per phase plus slack.
const MAX_TRANSITIONS_PER_TICK: usize = 12;

/// Observable cycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    CoarseRunning,
    CoarseAwaitingCoordReadback,
    CoarseAwaitingLabelReadback,
    Decoding,
    RefineRunning,
    RefineAwaitingReadback,
    Smoothing,
    ErrorReported,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::CoarseRunning => "coarse_running",
            PipelinePhase::CoarseAwaitingCoordReadback => "coarse_awaiting_coord_readback",
            PipelinePhase::CoarseAwaitingLabelReadback => "coarse_awaiting_label_readback",
            PipelinePhase::Decoding => "decoding",
            PipelinePhase::RefineRunning => "refine_running",
            PipelinePhase::RefineAwaitingReadback => "refine_awaiting_readback",
            PipelinePhase::Smoothing => "smoothing",
            PipelinePhase::ErrorReported => "error_reported",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`GazePipeline::start_cycle`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStart {
    Started,
    /// A cycle is in flight; the frame was ignored.
    AlreadyActive,
    /// Models failed to load; cycles cannot run.
    Disabled,
    /// The frame could not be turned into model input; reported to the sink.
    Rejected,
}

type Frame = Box<dyn FrameSource>;

enum PipelineState {
    Idle,
    CoarseRunning {
        frame: Frame,
        executor: StepLimitedExecutor,
        ticks: u32,
    },
    CoarseAwaitingCoordReadback {
        frame: Frame,
        executor: StepLimitedExecutor,
    },
    CoarseAwaitingLabelReadback {
        frame: Frame,
        coords: HostTensor,
    },
    Decoding {
        frame: Frame,
        coords: HostTensor,
        labels: HostTensor,
    },
    RefineRunning {
        detection: Detection,
        executor: StepLimitedExecutor,
        ticks: u32,
    },
    RefineAwaitingReadback {
        detection: Detection,
    },
    Smoothing {
        raw: GazeEstimate,
    },
    ErrorReported {
        error: Error,
    },
}

impl PipelineState {
    fn phase(&self) -> PipelinePhase {
        match self {
            PipelineState::Idle => PipelinePhase::Idle,
            PipelineState::CoarseRunning { .. } => PipelinePhase::CoarseRunning,
            PipelineState::CoarseAwaitingCoordReadback { .. } => {
                PipelinePhase::CoarseAwaitingCoordReadback
            }
            PipelineState::CoarseAwaitingLabelReadback { .. } => {
                PipelinePhase::CoarseAwaitingLabelReadback
            }
            PipelineState::Decoding { .. } => PipelinePhase::Decoding,
            PipelineState::RefineRunning { .. } => PipelinePhase::RefineRunning,
            PipelineState::RefineAwaitingReadback { .. } => PipelinePhase::RefineAwaitingReadback,
            PipelineState::Smoothing { .. } => PipelinePhase::Smoothing,
            PipelineState::ErrorReported { .. } => PipelinePhase::ErrorReported,
        }
    }
}

enum Transition {
    /// Stay in this state until the next tick.
    Yield(PipelineState),
    /// Continue processing in the same tick.
    Next(PipelineState),
}

/// The two model contexts a pipeline drives.
struct Models {
    coarse: Box<dyn ExecutionContext>,
    refine: Box<dyn ExecutionContext>,
}

pub struct GazePipeline {
    config: GazeConfig,
    budget: NonZeroUsize,
    decoder: DetectionDecoder,
    models: Option<Models>,
    state: PipelineState,
    coord_channel: ReadbackChannel,
    label_channel: ReadbackChannel,
    gaze_channel: ReadbackChannel,
    smoother: GazeSmoother,
    detections: Vec<Detection>,
    sink: Arc<dyn StatusSink>,
    last_error: Option<String>,
    cycles_completed: u64,
    cycles_failed: u64,
}

impl GazePipeline {
    /// Build a pipeline, loading both models from `backend`.
    ///
    /// An invalid configuration is an error. A model that fails to load is
    /// reported once to `sink` and leaves the pipeline disabled.
    pub fn new<B: InferenceBackend>(
        config: GazeConfig,
        backend: &B,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        config.validate()?;

        let loaded = backend::load_context(backend, &config.coarse_model, config.device).and_then(
            |coarse| {
                backend::load_context(backend, &config.refine_model, config.device)
                    .map(|refine| Models { coarse, refine })
            },
        );

        let models = match loaded {
            Ok(models) => {
                info!(
                    "Gaze pipeline ready: coarse={} refine={} device={:?}",
                    models.coarse.model_name(),
                    models.refine.model_name(),
                    config.device
                );
                Some(models)
            }
            Err(e) => {
                let error = match e {
                    Error::ModelNotLoaded(msg) => Error::ModelNotLoaded(msg),
                    other => Error::ModelNotLoaded(other.to_string()),
                };
                warn!("Gaze pipeline disabled: {}", error);
                sink.report_error(&error.to_string());
                let mut pipeline = Self::assemble(config, None, sink)?;
                pipeline.last_error = Some(error.to_string());
                return Ok(pipeline);
            }
        };

        Self::assemble(config, models, sink)
    }

    /// Build a pipeline around already-created contexts.
    pub fn with_contexts(
        config: GazeConfig,
        coarse: Box<dyn ExecutionContext>,
        refine: Box<dyn ExecutionContext>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, Some(Models { coarse, refine }), sink)
    }

    fn assemble(config: GazeConfig, models: Option<Models>, sink: Arc<dyn StatusSink>) -> Result<Self> {
        let budget = NonZeroUsize::new(config.steps_per_tick)
            .ok_or_else(|| Error::Configuration("steps_per_tick must be > 0".to_string()))?;
        let decoder = DetectionDecoder::new(
            config.num_classes,
            config.confidence_threshold,
            config.target_class_id,
        );
        let smoother = GazeSmoother::new(config.smoothing_factor);

        Ok(Self {
            config,
            budget,
            decoder,
            models,
            state: PipelineState::Idle,
            coord_channel: ReadbackChannel::new("coords"),
            label_channel: ReadbackChannel::new("labels"),
            gaze_channel: ReadbackChannel::new("gaze"),
            smoother,
            detections: Vec::new(),
            sink,
            last_error: None,
            cycles_completed: 0,
            cycles_failed: 0,
        })
    }

    /// Begin a detection cycle on `frame`.
    pub fn start_cycle<F>(&mut self, frame: F) -> CycleStart
    where
        F: FrameSource + 'static,
    {
        if self.models.is_none() {
            return CycleStart::Disabled;
        }
        if self.is_cycle_active() {
            debug!("Cycle already active in {}, frame ignored", self.phase());
            return CycleStart::AlreadyActive;
        }

        match self.begin(Box::new(frame)) {
            Ok(state) => {
                self.state = state;
                CycleStart::Started
            }
            Err(error) => {
                self.fail(error);
                CycleStart::Rejected
            }
        }
    }

    /// Count a frame the caller could not acquire as a failed cycle.
    ///
    /// Follows the same rules as `start_cycle`: ignored while a cycle is
    /// active or the pipeline is disabled, otherwise reported once.
    pub fn reject_frame(&mut self, error: Error) -> CycleStart {
        if self.models.is_none() {
            return CycleStart::Disabled;
        }
        if self.is_cycle_active() {
            debug!("Cycle already active in {}, frame failure ignored: {}", self.phase(), error);
            return CycleStart::AlreadyActive;
        }

        self.fail(error);
        CycleStart::Rejected
    }

    fn begin(&mut self, frame: Frame) -> Result<PipelineState> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InputUnavailable(format!("frame is {}x{}", width, height)));
        }

        let input = frame.to_tensor(Region::full(width, height), self.config.coarse_input_size)?;
        let models = self
            .models
            .as_mut()
            .ok_or_else(|| Error::ModelNotLoaded("coarse model".to_string()))?;
        let computation = models.coarse.schedule(input)?;

        debug!("Cycle started on {}x{} frame", width, height);
        Ok(PipelineState::CoarseRunning {
            frame,
            executor: StepLimitedExecutor::new("coarse", computation),
            ticks: 0,
        })
    }

    /// Drive the current cycle forward. Returns the phase after the tick.
    pub fn tick(&mut self) -> PipelinePhase {
        for _ in 0..MAX_TRANSITIONS_PER_TICK {
            let state = std::mem::replace(&mut self.state, PipelineState::Idle);
            let from = state.phase();

            match self.step(state) {
                Ok(Transition::Yield(next)) => {
                    self.state = next;
                    break;
                }
                Ok(Transition::Next(next)) => {
                    debug!("Pipeline {} -> {}", from, next.phase());
                    self.state = next;
                }
                Err(error) => {
                    debug!("Pipeline {} failed: {}", from, error);
                    self.state = PipelineState::ErrorReported { error };
                }
            }
        }

        self.phase()
    }

    fn step(&mut self, state: PipelineState) -> Result<Transition> {
        match state {
            PipelineState::Idle => Ok(Transition::Yield(PipelineState::Idle)),

            PipelineState::CoarseRunning {
                frame,
                mut executor,
                ticks,
            } => match executor.advance(self.budget)? {
                Advance::Continuing => {
                    let ticks = ticks + 1;
                    self.check_timeout(self.config.compute_timeout_ticks, ticks, PipelinePhase::CoarseRunning)?;
                    Ok(Transition::Yield(PipelineState::CoarseRunning {
                        frame,
                        executor,
                        ticks,
                    }))
                }
                Advance::Finished => {
                    self.coord_channel.request(executor.take_output(COORD_OUTPUT)?)?;
                    Ok(Transition::Next(PipelineState::CoarseAwaitingCoordReadback {
                        frame,
                        executor,
                    }))
                }
            },

            PipelineState::CoarseAwaitingCoordReadback {
                frame,
                mut executor,
            } => {
                if !self.coord_channel.poll_ready()? {
                    self.check_timeout(
                        self.config.readback_timeout_ticks,
                        self.coord_channel.polls(),
                        PipelinePhase::CoarseAwaitingCoordReadback,
                    )?;
                    return Ok(Transition::Yield(PipelineState::CoarseAwaitingCoordReadback {
                        frame,
                        executor,
                    }));
                }

                let coords = self.coord_channel.take()?;
                let labels = executor.take_output(LABEL_OUTPUT)?;
                // coarse computation is retired once both outputs are out
                drop(executor);
                self.label_channel.request(labels)?;
                Ok(Transition::Next(PipelineState::CoarseAwaitingLabelReadback { frame, coords }))
            }

            PipelineState::CoarseAwaitingLabelReadback { frame, coords } => {
                if !self.label_channel.poll_ready()? {
                    self.check_timeout(
                        self.config.readback_timeout_ticks,
                        self.label_channel.polls(),
                        PipelinePhase::CoarseAwaitingLabelReadback,
                    )?;
                    return Ok(Transition::Yield(PipelineState::CoarseAwaitingLabelReadback {
                        frame,
                        coords,
                    }));
                }

                let labels = self.label_channel.take()?;
                Ok(Transition::Next(PipelineState::Decoding {
                    frame,
                    coords,
                    labels,
                }))
            }

            PipelineState::Decoding {
                frame,
                coords,
                labels,
            } => {
                let detections = self.decoder.decode(coords.as_slice())?;
                debug!(
                    "Decoded {} detections from {} records ({} labels)",
                    detections.len(),
                    coords.len() / self.decoder.stride(),
                    labels.len()
                );
                drop(labels);
                drop(coords);

                let first = detections.first().copied();
                self.detections = detections;

                match first {
                    None => {
                        self.finish_cycle();
                        self.sink.report_status("no detection");
                        Ok(Transition::Yield(PipelineState::Idle))
                    }
                    Some(detection) => {
                        let executor = self.schedule_refine(&*frame, &detection)?;
                        Ok(Transition::Next(PipelineState::RefineRunning {
                            detection,
                            executor,
                            ticks: 0,
                        }))
                    }
                }
            }

            PipelineState::RefineRunning {
                detection,
                mut executor,
                ticks,
            } => match executor.advance(self.budget)? {
                Advance::Continuing => {
                    let ticks = ticks + 1;
                    self.check_timeout(self.config.compute_timeout_ticks, ticks, PipelinePhase::RefineRunning)?;
                    Ok(Transition::Yield(PipelineState::RefineRunning {
                        detection,
                        executor,
                        ticks,
                    }))
                }
                Advance::Finished => {
                    self.gaze_channel.request(executor.take_output(GAZE_OUTPUT)?)?;
                    drop(executor);
                    Ok(Transition::Next(PipelineState::RefineAwaitingReadback { detection }))
                }
            },

            PipelineState::RefineAwaitingReadback { detection } => {
                if !self.gaze_channel.poll_ready()? {
                    self.check_timeout(
                        self.config.readback_timeout_ticks,
                        self.gaze_channel.polls(),
                        PipelinePhase::RefineAwaitingReadback,
                    )?;
                    return Ok(Transition::Yield(PipelineState::RefineAwaitingReadback { detection }));
                }

                let output = self.gaze_channel.take()?;
                let raw = gaze_from_output(&output)?;
                Ok(Transition::Next(PipelineState::Smoothing { raw }))
            }

            PipelineState::Smoothing { raw } => {
                let smoothed = self.smoother.update(raw);
                self.finish_cycle();

                let units = self.config.model_units;
                let shown = smoothed.convert(units, self.config.output_units);
                self.sink.report_status(&format!(
                    "gaze yaw={:.2} pitch={:.2} ({:?})",
                    shown.yaw, shown.pitch, self.config.output_units
                ));
                Ok(Transition::Yield(PipelineState::Idle))
            }

            PipelineState::ErrorReported { error } => {
                self.fail(error);
                Ok(Transition::Yield(PipelineState::Idle))
            }
        }
    }

    fn schedule_refine(&mut self, frame: &dyn FrameSource, detection: &Detection) -> Result<StepLimitedExecutor> {
        let region = detection
            .frame_region(self.config.coarse_input_size, frame.dimensions(), self.config.crop_scale)
            .ok_or_else(|| {
                Error::InputUnavailable(format!("detection {:?} lies outside the frame", detection))
            })?;
        let input = frame.to_tensor(region, self.config.refine_input_size)?;
        let models = self
            .models
            .as_mut()
            .ok_or_else(|| Error::ModelNotLoaded("refine model".to_string()))?;
        let computation = models.refine.schedule(input)?;
        Ok(StepLimitedExecutor::new("refine", computation))
    }

    fn check_timeout(&self, limit: Option<u32>, ticks: u32, phase: PipelinePhase) -> Result<()> {
        match limit {
            Some(limit) if ticks >= limit => Err(Error::Timeout {
                stage: phase.as_str().to_string(),
                ticks,
            }),
            _ => Ok(()),
        }
    }

    fn finish_cycle(&mut self) {
        self.reset_channels();
        self.cycles_completed += 1;
        debug!("Cycle {} complete", self.cycles_completed);
    }

    /// Release cycle resources and report `error` once.
    fn fail(&mut self, error: Error) {
        self.state = PipelineState::Idle;
        self.reset_channels();
        self.cycles_failed += 1;

        let message = error.to_string();
        warn!("Gaze cycle failed: {}", message);
        self.sink.report_error(&message);
        self.last_error = Some(message);
    }

    fn reset_channels(&mut self) {
        self.coord_channel.reset();
        self.label_channel.reset();
        self.gaze_channel.reset();
    }

    /// Release every outstanding computation and tensor immediately.
    pub fn shutdown(&mut self) {
        if self.is_cycle_active() {
            info!("Shutting down gaze pipeline during {}", self.phase());
        }
        self.state = PipelineState::Idle;
        self.reset_channels();
    }

    pub fn is_cycle_active(&self) -> bool {
        !matches!(self.state, PipelineState::Idle)
    }

    /// `false` when model loading failed.
    pub fn is_enabled(&self) -> bool {
        self.models.is_some()
    }

    pub fn phase(&self) -> PipelinePhase {
        self.state.phase()
    }

    /// Detections decoded by the last cycle that reached decoding.
    pub fn latest_detections(&self) -> &[Detection] {
        &self.detections
    }

    /// Last raw gaze sample, in `output_units`.
    pub fn latest_gaze(&self) -> GazeEstimate {
        self.smoother
            .current()
            .convert(self.config.model_units, self.config.output_units)
    }

    /// Smoothed gaze, in `output_units`.
    pub fn smoothed_gaze(&self) -> GazeEstimate {
        self.smoother
            .smoothed()
            .convert(self.config.model_units, self.config.output_units)
    }

    /// Whether the smoothed gaze lies inside the given degree thresholds.
    ///
    /// Always `false` before the first gaze sample.
    pub fn is_looking_at_camera(&self, yaw_threshold_deg: f32, pitch_threshold_deg: f32) -> bool {
        self.smoother.is_initialized()
            && self
                .smoother
                .smoothed()
                .convert(self.config.model_units, AngleUnits::Degrees)
                .within_degrees(yaw_threshold_deg, pitch_threshold_deg)
    }

    /// [`is_looking_at_camera`](Self::is_looking_at_camera) with the configured thresholds.
    pub fn looking_at_camera(&self) -> bool {
        self.is_looking_at_camera(self.config.yaw_threshold_deg, self.config.pitch_threshold_deg)
    }

    pub fn smoothing_state(&self) -> &SmoothingState {
        self.smoother.state()
    }

    pub fn reset_smoothing(&mut self) {
        self.smoother.reset();
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed
    }

    pub fn config(&self) -> &GazeConfig {
        &self.config
    }
}

impl Drop for GazePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read `[yaw, pitch]` from the gaze model output.
fn gaze_from_output(output: &HostTensor) -> Result<GazeEstimate> {
    match output.as_slice() {
        [yaw, pitch, ..] if yaw.is_finite() && pitch.is_finite() => Ok(GazeEstimate::new(*yaw, *pitch)),
        values => Err(Error::MalformedOutput(format!(
            "gaze output needs two finite values, got {:?}",
            values
        ))),
    }
}
