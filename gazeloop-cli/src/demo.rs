//! Synthetic scene and scripted models for running without model files
//!
//! The synthetic frame is a bright disc ("face") drifting over a grey
//! background with a small dark disc ("pupil") inside it. The scripted
//! coarse detector boxes the bright pixels; the scripted gaze model turns
//! the pupil offset inside the crop into yaw/pitch.

use gazeloop_core::HostTensor;
use gazeloop_eye::backend::{ModelScript, OutputScript};
use gazeloop_eye::{GazeConfig, ImageFrame, SimulatedBackend};
use image::{Rgb, RgbImage};

const BACKGROUND: Rgb<u8> = Rgb([60, 60, 60]);
const FACE: Rgb<u8> = Rgb([235, 235, 235]);
const PUPIL: Rgb<u8> = Rgb([20, 20, 20]);

const BRIGHT: f32 = 0.8;
const DARK: f32 = 0.2;
/// Radians of gaze per unit of normalized pupil offset.
const GAZE_GAIN: f32 = 0.8;

const COARSE_STEPS: usize = 24;
const REFINE_STEPS: usize = 12;

/// Register scripted coarse and gaze models under the configured asset paths.
pub fn simulated_backend(config: &GazeConfig) -> SimulatedBackend {
    let backend = SimulatedBackend::new();
    let num_classes = config.num_classes;
    let class_id = config.target_class_id;

    backend.set_script(
        &config.coarse_model,
        ModelScript::new(COARSE_STEPS)
            .with_output(OutputScript::computed(move |input| {
                detect_bright_region(input, num_classes, class_id)
            }))
            .with_output(OutputScript::fixed(vec![class_id as f32]).with_latency(1)),
    );
    backend.set_script(
        &config.refine_model,
        ModelScript::new(REFINE_STEPS)
            .with_output(OutputScript::computed(estimate_pupil_gaze).with_latency(2)),
    );

    backend
}

/// Frame `index` of the synthetic sequence.
pub fn synthetic_frame(index: u64, width: u32, height: u32) -> ImageFrame {
    let t = index as f32;
    let radius = (width.min(height) as f32 * 0.18).max(4.0);
    let face_x = width as f32 * 0.5 + width as f32 * 0.25 * (t * 0.05).sin();
    let face_y = height as f32 * 0.5 + height as f32 * 0.1 * (t * 0.03).cos();

    let pupil_radius = radius * 0.2;
    let pupil_x = face_x + radius * 0.5 * (t * 0.13).sin();
    let pupil_y = face_y + radius * 0.25 * (t * 0.07).cos();

    let image = RgbImage::from_fn(width, height, |x, y| {
        let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
        if distance(fx, fy, pupil_x, pupil_y) <= pupil_radius {
            PUPIL
        } else if distance(fx, fy, face_x, face_y) <= radius {
            FACE
        } else {
            BACKGROUND
        }
    });

    ImageFrame::new(image)
}

fn distance(ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// Per-pixel mean over the three planes of a `[1, 3, h, w]` tensor.
fn luminance(input: &HostTensor) -> Option<(usize, usize, Vec<f32>)> {
    let (h, w) = match input.shape() {
        [1, 3, h, w] => (*h, *w),
        _ => return None,
    };
    let plane = h * w;
    let data = input.as_slice();
    let lum = (0..plane)
        .map(|i| (data[i] + data[plane + i] + data[2 * plane + i]) / 3.0)
        .collect();
    Some((h, w, lum))
}

/// One detector record boxing every bright pixel, or an all-zero record.
fn detect_bright_region(input: &HostTensor, num_classes: usize, class_id: usize) -> Vec<f32> {
    let mut record = vec![0.0f32; 5 + num_classes];
    let Some((_, w, lum)) = luminance(input) else {
        return record;
    };

    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for (i, _) in lum.iter().enumerate().filter(|(_, v)| **v > BRIGHT) {
        let (x, y) = (i % w, i / w);
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    if let Some((x0, y0, x1, y1)) = bounds {
        let (bw, bh) = ((x1 - x0 + 1) as f32, (y1 - y0 + 1) as f32);
        record[0] = x0 as f32 + bw / 2.0;
        record[1] = y0 as f32 + bh / 2.0;
        record[2] = bw;
        record[3] = bh;
        record[4] = if bw * bh >= 4.0 { 0.95 } else { 0.3 };
        if let Some(score) = record.get_mut(5 + class_id) {
            *score = 0.9;
        }
    }
    record
}

/// Yaw/pitch (radians) from the dark-pixel centroid relative to the crop center.
fn estimate_pupil_gaze(input: &HostTensor) -> Vec<f32> {
    let Some((h, w, lum)) = luminance(input) else {
        return vec![0.0, 0.0];
    };

    let (mut sx, mut sy, mut n) = (0.0f32, 0.0f32, 0usize);
    for (i, _) in lum.iter().enumerate().filter(|(_, v)| **v < DARK) {
        sx += (i % w) as f32 + 0.5;
        sy += (i / w) as f32 + 0.5;
        n += 1;
    }
    if n == 0 {
        return vec![0.0, 0.0];
    }

    let (half_w, half_h) = (w as f32 / 2.0, h as f32 / 2.0);
    let ox = (sx / n as f32 - half_w) / half_w;
    let oy = (sy / n as f32 - half_h) / half_h;
    vec![ox * GAZE_GAIN, -oy * GAZE_GAIN]
}
