//! Detection cycle scenarios driven through the simulated backend

use gazeloop_core::{AngleUnits, Error, GazeEstimate};
use gazeloop_eye::backend::{ModelScript, OutputScript};
use gazeloop_eye::{
    CycleStart, GazeConfig, GazePipeline, ImageFrame, MemoryStatusSink, PipelinePhase,
    SimulatedBackend,
};
use image::RgbImage;
use std::sync::Arc;

const COARSE: &str = "models/coarse.onnx";
const REFINE: &str = "models/refine.onnx";

fn config() -> GazeConfig {
    GazeConfig {
        steps_per_tick: 4,
        coarse_input_size: (32, 32),
        refine_input_size: (8, 8),
        num_classes: 3,
        target_class_id: 0,
        smoothing_factor: 0.5,
        model_units: AngleUnits::Degrees,
        output_units: AngleUnits::Degrees,
        readback_timeout_ticks: Some(5),
        compute_timeout_ticks: None,
        coarse_model: COARSE.into(),
        refine_model: REFINE.into(),
        ..GazeConfig::default()
    }
}

/// One face at the center of the coarse input.
fn face() -> Vec<f32> {
    vec![16.0, 16.0, 8.0, 8.0, 0.9, 0.8, 0.1, 0.1]
}

fn coarse(steps: usize) -> ModelScript {
    ModelScript::new(steps)
        .with_output(OutputScript::fixed(face()))
        .with_output(OutputScript::fixed(vec![0.0]))
}

fn refine(yaw: f32, pitch: f32) -> ModelScript {
    ModelScript::new(3).with_output(OutputScript::fixed(vec![yaw, pitch]))
}

fn frame() -> ImageFrame {
    ImageFrame::new(RgbImage::new(64, 48))
}

struct Harness {
    backend: SimulatedBackend,
    sink: MemoryStatusSink,
    pipeline: GazePipeline,
}

impl Harness {
    fn new(config: GazeConfig, coarse: ModelScript, refine: ModelScript) -> Self {
        let backend = SimulatedBackend::new();
        backend.set_script(COARSE, coarse);
        backend.set_script(REFINE, refine);
        let sink = MemoryStatusSink::new();
        let pipeline = GazePipeline::new(config, &backend, Arc::new(sink.clone())).unwrap();
        Self {
            backend,
            sink,
            pipeline,
        }
    }

    /// Tick until the cycle ends, returning how many ticks it took.
    fn run_cycle(&mut self, limit: usize) -> usize {
        for n in 1..=limit {
            if self.pipeline.tick() == PipelinePhase::Idle {
                return n;
            }
        }
        panic!("cycle still active after {} ticks", limit);
    }
}

#[test]
fn test_cycle_amortized_over_ticks() {
    let mut h = Harness::new(config(), coarse(10), refine(2.0, 1.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    // 10 coarse steps at 4 per tick: ceil(10/4) = 3 ticks; refine finishes in the third
    assert_eq!(h.run_cycle(10), 3);
    assert_eq!(h.pipeline.cycles_completed(), 1);
    assert_eq!(h.pipeline.smoothed_gaze(), GazeEstimate::new(2.0, 1.0));
    assert!(h.sink.errors().is_empty());
}

#[test]
fn test_single_flight() {
    let mut h = Harness::new(config(), coarse(40), refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    for _ in 0..3 {
        h.pipeline.tick();
        assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::AlreadyActive);
    }
    assert_eq!(h.backend.scheduled(), 1);

    h.run_cycle(20);
    assert_eq!(h.pipeline.cycles_completed(), 1);
    assert_eq!(h.backend.scheduled(), 2);
}

#[test]
fn test_error_then_recovery() {
    let calls = std::sync::atomic::AtomicUsize::new(0);
    // second cycle produces an empty coordinate buffer
    let coords = OutputScript::computed(move |_| {
        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == 1 {
            Vec::new()
        } else {
            face()
        }
    });
    let coarse = ModelScript::new(1)
        .with_output(coords)
        .with_output(OutputScript::fixed(vec![0.0]));
    let mut h = Harness::new(config(), coarse, refine(4.0, 4.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(10);
    assert_eq!(h.pipeline.cycles_completed(), 1);

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(10);
    assert_eq!(h.pipeline.cycles_failed(), 1);
    assert_eq!(h.sink.errors().len(), 1);
    assert!(h.sink.errors()[0].starts_with("Empty output"));
    assert!(h.pipeline.last_error().is_some());
    assert!(!h.pipeline.is_cycle_active());
    assert_eq!(h.backend.live_computations(), 0);
    assert_eq!(h.backend.live_tensors(), 0);

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(10);
    assert_eq!(h.pipeline.cycles_completed(), 2);
    assert_eq!(h.sink.errors().len(), 1);
}

#[test]
fn test_unrealized_output_is_empty_output() {
    let coarse = ModelScript::new(1)
        .with_output(OutputScript::fixed(face()).unrealized())
        .with_output(OutputScript::fixed(vec![0.0]));
    let mut h = Harness::new(config(), coarse, refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);
    assert_eq!(h.pipeline.cycles_failed(), 1);
    assert!(h.sink.errors()[0].starts_with("Empty output"));
    assert_eq!(h.backend.live_tensors(), 0);
}

#[test]
fn test_readback_timeout() {
    let coarse = ModelScript::new(1)
        .with_output(OutputScript::fixed(face()).never_ready())
        .with_output(OutputScript::fixed(vec![0.0]));
    let mut h = Harness::new(config(), coarse, refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    let ticks = h.run_cycle(20);
    assert_eq!(ticks, 5);
    assert_eq!(h.pipeline.cycles_failed(), 1);

    let errors = h.sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("coarse_awaiting_coord_readback"));
    assert_eq!(h.backend.live_computations(), 0);
    assert_eq!(h.backend.live_tensors(), 0);
}

#[test]
fn test_compute_timeout() {
    let mut cfg = config();
    cfg.compute_timeout_ticks = Some(2);
    let mut h = Harness::new(cfg, coarse(100), refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    assert_eq!(h.run_cycle(10), 2);
    assert!(h.sink.errors()[0].contains("coarse_running"));
}

#[test]
fn test_computation_failure_reported_once() {
    let mut h = Harness::new(config(), coarse(10).failing_at(6), refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    assert_eq!(h.run_cycle(10), 2);

    let errors = h.sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Computation failed"));
    assert_eq!(h.backend.live_computations(), 0);

    // more ticks do not repeat the report
    for _ in 0..5 {
        h.pipeline.tick();
    }
    assert_eq!(h.sink.errors().len(), 1);
}

#[test]
fn test_no_detection_completes_without_refine() {
    let coarse = ModelScript::new(1)
        .with_output(OutputScript::fixed(vec![16.0, 16.0, 8.0, 8.0, 0.9, 0.1, 0.8, 0.1]))
        .with_output(OutputScript::fixed(vec![1.0]));
    let mut h = Harness::new(config(), coarse, refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    assert_eq!(h.run_cycle(5), 1);
    assert!(h.pipeline.latest_detections().is_empty());
    assert_eq!(h.pipeline.cycles_completed(), 1);
    assert_eq!(h.backend.scheduled(), 1);
    assert!(h.sink.errors().is_empty());
}

#[test]
fn test_detection_outside_frame() {
    // box lies left of the coarse input
    let coarse = ModelScript::new(1)
        .with_output(OutputScript::fixed(vec![-40.0, 16.0, 8.0, 8.0, 0.9, 0.8, 0.1, 0.1]))
        .with_output(OutputScript::fixed(vec![0.0]));
    let mut h = Harness::new(config(), coarse, refine(0.0, 0.0));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);
    assert_eq!(h.pipeline.cycles_failed(), 1);
    assert!(h.sink.errors()[0].starts_with("Input unavailable"));
}

#[test]
fn test_refine_sees_cropped_input() {
    let refine = ModelScript::new(1).with_output(OutputScript::computed(|input| {
        // report the input shape back as the gaze
        let shape = input.shape();
        vec![shape[2] as f32, shape[3] as f32]
    }));
    let mut h = Harness::new(config(), coarse(1), refine);

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);
    assert_eq!(h.pipeline.latest_gaze(), GazeEstimate::new(8.0, 8.0));
}

#[test]
fn test_smoothing_across_cycles() {
    let values = std::sync::Mutex::new(vec![(0.0f32, 0.0f32), (10.0, -10.0)].into_iter());
    let refine = ModelScript::new(1).with_output(OutputScript::computed(move |_| {
        let (yaw, pitch) = values.lock().unwrap().next().unwrap_or((0.0, 0.0));
        vec![yaw, pitch]
    }));
    let mut h = Harness::new(config(), coarse(1), refine);

    for _ in 0..2 {
        assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
        h.run_cycle(5);
    }

    assert_eq!(h.pipeline.latest_gaze(), GazeEstimate::new(10.0, -10.0));
    assert_eq!(h.pipeline.smoothed_gaze(), GazeEstimate::new(5.0, -5.0));

    h.pipeline.reset_smoothing();
    assert!(!h.pipeline.smoothing_state().initialized);
    assert!(!h.pipeline.looking_at_camera());
}

#[test]
fn test_looking_at_camera_thresholds() {
    let mut h = Harness::new(config(), coarse(1), refine(14.9, 0.0));
    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);
    assert!(h.pipeline.is_looking_at_camera(15.0, 10.0));

    let mut h = Harness::new(config(), coarse(1), refine(15.1, 0.0));
    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);
    assert!(!h.pipeline.is_looking_at_camera(15.0, 10.0));
}

#[test]
fn test_radian_model_reported_in_degrees() {
    let mut cfg = config();
    cfg.model_units = AngleUnits::Radians;
    cfg.output_units = AngleUnits::Degrees;
    let mut h = Harness::new(cfg, coarse(1), refine(0.1, -0.05));

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    h.run_cycle(5);

    let gaze = h.pipeline.smoothed_gaze();
    assert!((gaze.yaw - 5.7296).abs() < 1e-3);
    assert!((gaze.pitch + 2.8648).abs() < 1e-3);
    assert!(h.pipeline.looking_at_camera());
}

#[test]
fn test_missing_model_disables() {
    let backend = SimulatedBackend::new();
    backend.set_script(COARSE, coarse(1));
    let sink = MemoryStatusSink::new();
    let mut pipeline = GazePipeline::new(config(), &backend, Arc::new(sink.clone())).unwrap();

    assert!(!pipeline.is_enabled());
    assert_eq!(pipeline.start_cycle(frame()), CycleStart::Disabled);
    assert_eq!(pipeline.tick(), PipelinePhase::Idle);
    assert_eq!(sink.errors().len(), 1);
    assert!(sink.errors()[0].starts_with("Model not loaded"));
}

#[test]
fn test_shutdown_mid_refine() {
    let refine = ModelScript::new(1).with_output(OutputScript::fixed(vec![0.0, 0.0]).never_ready());
    let mut h = Harness::new(config(), coarse(1), refine);

    assert_eq!(h.pipeline.start_cycle(frame()), CycleStart::Started);
    assert_eq!(h.pipeline.tick(), PipelinePhase::RefineAwaitingReadback);
    assert_eq!(h.backend.live_tensors(), 1);

    h.pipeline.shutdown();
    assert_eq!(h.backend.live_computations(), 0);
    assert_eq!(h.backend.live_tensors(), 0);
    assert!(h.sink.errors().is_empty());
}

#[test]
fn test_drop_releases_resources() {
    let backend = SimulatedBackend::new();
    backend.set_script(COARSE, coarse(50));
    backend.set_script(REFINE, refine(0.0, 0.0));
    {
        let mut pipeline = GazePipeline::new(config(), &backend, Arc::new(MemoryStatusSink::new())).unwrap();
        assert_eq!(pipeline.start_cycle(frame()), CycleStart::Started);
        pipeline.tick();
        assert_eq!(backend.live_computations(), 1);
    }
    assert_eq!(backend.live_computations(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let mut cfg = config();
    cfg.smoothing_factor = 1.5;
    let backend = SimulatedBackend::new();
    let result = GazePipeline::new(cfg, &backend, Arc::new(MemoryStatusSink::new()));
    assert!(matches!(result, Err(Error::Configuration(_))));
}
