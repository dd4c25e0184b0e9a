//! Value types exchanged between the scheduler and its collaborators

use serde::{Deserialize, Serialize};

/// Unit an angle is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleUnits {
    Degrees,
    Radians,
}

impl AngleUnits {
    /// Convert `value` from `self` into `target`.
    pub fn convert(self, value: f32, target: AngleUnits) -> f32 {
        match (self, target) {
            (AngleUnits::Degrees, AngleUnits::Radians) => value.to_radians(),
            (AngleUnits::Radians, AngleUnits::Degrees) => value.to_degrees(),
            _ => value,
        }
    }
}

/// Head/eye gaze direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GazeEstimate {
    pub yaw: f32,
    pub pitch: f32,
}

impl GazeEstimate {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }

    /// Re-express an estimate held in `from` units in `to` units.
    pub fn convert(self, from: AngleUnits, to: AngleUnits) -> Self {
        Self {
            yaw: from.convert(self.yaw, to),
            pitch: from.convert(self.pitch, to),
        }
    }

    /// `true` when both axes sit strictly inside the thresholds (degrees).
    ///
    /// `self` must already be in degrees.
    pub fn within_degrees(&self, yaw_threshold_deg: f32, pitch_threshold_deg: f32) -> bool {
        self.yaw.abs() < yaw_threshold_deg && self.pitch.abs() < pitch_threshold_deg
    }
}

/// Axis-aligned pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// The whole of a `width` x `height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }

    /// Build a region from float corners, clamped to the frame.
    ///
    /// Returns `None` when nothing of the rectangle lies inside the frame.
    pub fn from_corners_clamped(
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        frame: (u32, u32),
    ) -> Option<Self> {
        if !(x0.is_finite() && y0.is_finite() && x1.is_finite() && y1.is_finite()) {
            return None;
        }

        let (fw, fh) = (frame.0 as f32, frame.1 as f32);
        let left = x0.min(x1).clamp(0.0, fw).floor();
        let top = y0.min(y1).clamp(0.0, fh).floor();
        let right = x0.max(x1).clamp(0.0, fw).ceil();
        let bottom = y0.max(y1).clamp(0.0, fh).ceil();

        let width = (right - left) as u32;
        let height = (bottom - top) as u32;
        if width == 0 || height == 0 {
            return None;
        }

        Some(Self {
            x: left as u32,
            y: top as u32,
            width,
            height,
        })
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A single decoded detection in coarse-model input pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub center: (f32, f32),
    pub size: (f32, f32),
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    /// Map this detection onto the source frame.
    ///
    /// `model_input` is the resolution the coarse model saw, `frame` the
    /// original frame resolution; the box is grown by `crop_scale` around its
    /// center before clamping.
    pub fn frame_region(
        &self,
        model_input: (u32, u32),
        frame: (u32, u32),
        crop_scale: f32,
    ) -> Option<Region> {
        if model_input.0 == 0 || model_input.1 == 0 {
            return None;
        }

        let sx = frame.0 as f32 / model_input.0 as f32;
        let sy = frame.1 as f32 / model_input.1 as f32;

        let cx = self.center.0 * sx;
        let cy = self.center.1 * sy;
        let half_w = self.size.0 * sx * crop_scale * 0.5;
        let half_h = self.size.1 * sy * crop_scale * 0.5;

        Region::from_corners_clamped(cx - half_w, cy - half_h, cx + half_w, cy + half_h, frame)
    }
}
