use gazeloop_core::{Detection, GazeEstimate, HostTensor, Region};
use gazeloop_eye::backend::{Device, InferenceBackend, ModelScript, OutputScript};
use gazeloop_eye::{
    Advance, CycleStart, DetectionDecoder, GazeConfig, GazePipeline, GazeSmoother, ImageFrame,
    NullStatusSink, PipelinePhase, SimulatedBackend, StepLimitedExecutor,
};
use image::RgbImage;
use proptest::prelude::*;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

fn executor_for(steps: usize) -> (SimulatedBackend, StepLimitedExecutor) {
    let backend = SimulatedBackend::new();
    backend.set_script("model.onnx", ModelScript::new(steps).with_output(OutputScript::fixed(vec![1.0])));
    let model = backend.load(Path::new("model.onnx")).unwrap();
    let mut context = backend.create_context(model, Device::Cpu).unwrap();
    let computation = context.schedule(HostTensor::from_vec(vec![0.0])).unwrap();
    (backend, StepLimitedExecutor::new("prop", computation))
}

fn record() -> impl Strategy<Value = Vec<f32>> {
    (
        0.0f32..640.0,
        0.0f32..640.0,
        1.0f32..200.0,
        1.0f32..200.0,
        0.0f32..1.0,
        prop::collection::vec(0.0f32..1.0, 3),
    )
        .prop_map(|(cx, cy, w, h, conf, scores)| {
            let mut r = vec![cx, cy, w, h, conf];
            r.extend(scores);
            r
        })
}

proptest! {
    #[test]
    fn test_advance_respects_budget(steps in 1usize..300, budget in 1usize..32) {
        let (_backend, mut executor) = executor_for(steps);
        let budget = NonZeroUsize::new(budget).unwrap();
        let expected = (steps + budget.get() - 1) / budget.get();

        for call in 1..=expected {
            let before = executor.steps_taken();
            let result = executor.advance(budget).unwrap();
            prop_assert!(executor.steps_taken() - before <= budget.get() as u64);
            if call < expected {
                prop_assert_eq!(result, Advance::Continuing);
            } else {
                prop_assert_eq!(result, Advance::Finished);
            }
        }
        prop_assert_eq!(executor.steps_taken(), steps as u64);
    }

    #[test]
    fn test_decoder_deterministic_and_filtered(
        records in prop::collection::vec(record(), 0..64),
        threshold in 0.0f32..1.0,
        target in 0usize..3
    ) {
        let buffer: Vec<f32> = records.iter().flatten().copied().collect();
        let decoder = DetectionDecoder::new(3, threshold, target);

        let first = decoder.decode(&buffer).unwrap();
        let second = decoder.decode(&buffer).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.len() <= records.len());

        for detection in &first {
            prop_assert!(detection.confidence >= threshold);
            prop_assert_eq!(detection.class_id, target);
        }
    }

    #[test]
    fn test_decoder_threshold_monotonic(
        records in prop::collection::vec(record(), 0..64),
        low in 0.0f32..0.5,
        high in 0.5f32..1.0
    ) {
        let buffer: Vec<f32> = records.iter().flatten().copied().collect();
        let loose = DetectionDecoder::new(3, low, 0).decode(&buffer).unwrap();
        let strict = DetectionDecoder::new(3, high, 0).decode(&buffer).unwrap();

        prop_assert!(strict.len() <= loose.len());
        for detection in &strict {
            prop_assert!(loose.contains(detection));
        }
    }

    #[test]
    fn test_decoder_rejects_ragged_buffers(len in 1usize..200) {
        prop_assume!(len % 8 != 0);
        let decoder = DetectionDecoder::new(3, 0.5, 0);
        prop_assert!(decoder.decode(&vec![0.5; len]).is_err());
    }

    #[test]
    fn test_smoothing_stays_between_previous_and_raw(
        samples in prop::collection::vec((-90.0f32..90.0, -90.0f32..90.0), 1..50),
        factor in 0.0f32..0.99
    ) {
        let mut smoother = GazeSmoother::new(factor);
        let (y0, p0) = samples[0];
        prop_assert_eq!(smoother.update(GazeEstimate::new(y0, p0)), GazeEstimate::new(y0, p0));

        for &(yaw, pitch) in &samples[1..] {
            let previous = smoother.smoothed();
            let out = smoother.update(GazeEstimate::new(yaw, pitch));
            let eps = 1e-3;
            prop_assert!(out.yaw >= previous.yaw.min(yaw) - eps && out.yaw <= previous.yaw.max(yaw) + eps);
            prop_assert!(out.pitch >= previous.pitch.min(pitch) - eps && out.pitch <= previous.pitch.max(pitch) + eps);
            prop_assert_eq!(smoother.current(), GazeEstimate::new(yaw, pitch));
        }
    }

    #[test]
    fn test_frame_region_inside_frame(
        cx in -100.0f32..800.0,
        cy in -100.0f32..800.0,
        w in 0.0f32..400.0,
        h in 0.0f32..400.0,
        frame_w in 1u32..2000,
        frame_h in 1u32..2000,
        scale in 0.5f32..2.0
    ) {
        let detection = Detection { center: (cx, cy), size: (w, h), confidence: 0.9, class_id: 0 };
        if let Some(region) = detection.frame_region((640, 640), (frame_w, frame_h), scale) {
            prop_assert!(region.width > 0 && region.height > 0);
            prop_assert!(region.x + region.width <= frame_w);
            prop_assert!(region.y + region.height <= frame_h);
        }
    }

    #[test]
    fn test_clamped_region_never_escapes(
        x0 in -500.0f32..500.0,
        y0 in -500.0f32..500.0,
        x1 in -500.0f32..500.0,
        y1 in -500.0f32..500.0
    ) {
        if let Some(region) = Region::from_corners_clamped(x0, y0, x1, y1, (320, 240)) {
            prop_assert!(region.x + region.width <= 320);
            prop_assert!(region.y + region.height <= 240);
            prop_assert!(region.area() > 0);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_any_cycle_finishes_and_releases(
        coarse_steps in 1usize..40,
        refine_steps in 1usize..40,
        budget in 1usize..10,
        coord_latency in 0u32..4,
        label_latency in 0u32..4,
        gaze_latency in 0u32..4
    ) {
        let backend = SimulatedBackend::new();
        backend.set_script(
            "coarse.onnx",
            ModelScript::new(coarse_steps)
                .with_output(OutputScript::fixed(vec![16.0, 16.0, 8.0, 8.0, 0.9, 0.9]).with_latency(coord_latency))
                .with_output(OutputScript::fixed(vec![0.0]).with_latency(label_latency)),
        );
        backend.set_script(
            "refine.onnx",
            ModelScript::new(refine_steps)
                .with_output(OutputScript::fixed(vec![0.05, -0.05]).with_latency(gaze_latency)),
        );
        let config = GazeConfig {
            steps_per_tick: budget,
            coarse_input_size: (32, 32),
            refine_input_size: (8, 8),
            num_classes: 1,
            coarse_model: "coarse.onnx".into(),
            refine_model: "refine.onnx".into(),
            ..GazeConfig::default()
        };
        let mut pipeline = GazePipeline::new(config, &backend, Arc::new(NullStatusSink)).unwrap();

        prop_assert_eq!(pipeline.start_cycle(ImageFrame::new(RgbImage::new(48, 48))), CycleStart::Started);
        let mut ticks = 0;
        while pipeline.tick() != PipelinePhase::Idle {
            ticks += 1;
            prop_assert!(ticks < 500);
        }
        ticks += 1;

        let coarse_ticks = (coarse_steps + budget - 1) / budget;
        prop_assert!(ticks >= coarse_ticks);
        prop_assert_eq!(pipeline.cycles_completed(), 1);
        prop_assert_eq!(pipeline.cycles_failed(), 0);
        prop_assert_eq!(backend.live_computations(), 0);
        prop_assert_eq!(backend.live_tensors(), 0);
    }
}
