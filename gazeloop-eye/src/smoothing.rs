//! Temporal smoothing of gaze estimates

use gazeloop_core::GazeEstimate;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SmoothingState {
    /// Last raw sample.
    pub current: GazeEstimate,
    pub smoothed: GazeEstimate,
    pub initialized: bool,
}

/// Exponential moving average over (yaw, pitch).
///
/// A factor close to 1 smooths heavily; close to 0 tracks the raw signal.
/// The first sample is taken verbatim.
#[derive(Debug, Clone)]
pub struct GazeSmoother {
    factor: f32,
    state: SmoothingState,
}

impl GazeSmoother {
    pub fn new(factor: f32) -> Self {
        Self {
            factor,
            state: SmoothingState::default(),
        }
    }

    pub fn update(&mut self, raw: GazeEstimate) -> GazeEstimate {
        self.state.current = raw;

        if self.state.initialized {
            let t = 1.0 - self.factor;
            self.state.smoothed = GazeEstimate {
                yaw: lerp(self.state.smoothed.yaw, raw.yaw, t),
                pitch: lerp(self.state.smoothed.pitch, raw.pitch, t),
            };
        } else {
            self.state.smoothed = raw;
            self.state.initialized = true;
        }

        self.state.smoothed
    }

    pub fn state(&self) -> &SmoothingState {
        &self.state
    }

    pub fn current(&self) -> GazeEstimate {
        self.state.current
    }

    pub fn smoothed(&self) -> GazeEstimate {
        self.state.smoothed
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    pub fn reset(&mut self) {
        self.state = SmoothingState::default();
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
