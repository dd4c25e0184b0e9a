//! Configuration for gazeloop-eye

use crate::backend::Device;
use gazeloop_core::{AngleUnits, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeConfig {
    /// Computation steps performed per model per tick
    pub steps_per_tick: usize,
    /// Coarse detector input resolution (width, height)
    pub coarse_input_size: (u32, u32),
    /// Gaze model input resolution (width, height)
    pub refine_input_size: (u32, u32),
    pub confidence_threshold: f32,
    /// EMA factor in [0, 1); higher is smoother
    pub smoothing_factor: f32,
    /// Class the coarse detector must report for a detection to be refined
    pub target_class_id: usize,
    /// Number of class scores per detector record
    pub num_classes: usize,
    /// Units returned by gaze accessors
    pub output_units: AngleUnits,
    /// Units the gaze model reports in
    pub model_units: AngleUnits,
    pub yaw_threshold_deg: f32,
    pub pitch_threshold_deg: f32,
    /// Growth factor applied to the detection box before cropping
    pub crop_scale: f32,
    /// Ticks a readback may stay outstanding before the cycle fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readback_timeout_ticks: Option<u32>,
    /// Ticks a model may keep running before the cycle fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_timeout_ticks: Option<u32>,
    pub device: Device,
    pub coarse_model: PathBuf,
    pub refine_model: PathBuf,
}

impl Default for GazeConfig {
    fn default() -> Self {
        Self {
            steps_per_tick: 8,
            coarse_input_size: (640, 640),
            refine_input_size: (448, 448),
            confidence_threshold: 0.5,
            smoothing_factor: 0.8,
            target_class_id: 0,
            num_classes: 80,
            output_units: AngleUnits::Degrees,
            model_units: AngleUnits::Radians,
            yaw_threshold_deg: 15.0,
            pitch_threshold_deg: 10.0,
            crop_scale: 1.0,
            readback_timeout_ticks: Some(120),
            compute_timeout_ticks: None,
            device: Device::GpuCompute,
            coarse_model: PathBuf::from("models/coarse_detector.onnx"),
            refine_model: PathBuf::from("models/gaze_estimator.onnx"),
        }
    }
}

impl GazeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.steps_per_tick == 0 {
            return Err(invalid("steps_per_tick must be > 0"));
        }

        for (name, size) in [
            ("coarse_input_size", self.coarse_input_size),
            ("refine_input_size", self.refine_input_size),
        ] {
            if size.0 == 0 || size.1 == 0 {
                return Err(invalid(&format!("{} must be non-zero", name)));
            }
            if size.0 > 8192 || size.1 > 8192 {
                return Err(invalid(&format!("{} too large (max 8192)", name)));
            }
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid("confidence_threshold must be within [0, 1]"));
        }

        if !(0.0..1.0).contains(&self.smoothing_factor) {
            return Err(invalid("smoothing_factor must be within [0, 1)"));
        }

        if self.num_classes == 0 {
            return Err(invalid("num_classes must be > 0"));
        }

        if self.target_class_id >= self.num_classes {
            return Err(invalid(&format!(
                "target_class_id {} out of range for {} classes",
                self.target_class_id, self.num_classes
            )));
        }

        if !(self.yaw_threshold_deg > 0.0) || !(self.pitch_threshold_deg > 0.0) {
            return Err(invalid("gaze thresholds must be > 0"));
        }

        if !(self.crop_scale > 0.0) || !self.crop_scale.is_finite() {
            return Err(invalid("crop_scale must be a positive number"));
        }

        if self.readback_timeout_ticks == Some(0) || self.compute_timeout_ticks == Some(0) {
            return Err(invalid("timeouts must be at least one tick when set"));
        }

        Ok(())
    }

    /// Load configuration from a TOML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        content.parse()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Apply `GAZELOOP_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(steps) = lookup("GAZELOOP_STEPS_PER_TICK").and_then(|v| v.parse().ok()) {
            self.steps_per_tick = steps;
        }

        if let Some(device) = lookup("GAZELOOP_DEVICE") {
            match device.to_ascii_lowercase().as_str() {
                "cpu" => self.device = Device::Cpu,
                "gpu" | "gpu_compute" => self.device = Device::GpuCompute,
                _ => {}
            }
        }

        if let Some(threshold) = lookup("GAZELOOP_CONFIDENCE").and_then(|v| v.parse().ok()) {
            self.confidence_threshold = threshold;
        }
    }
}

impl FromStr for GazeConfig {
    type Err = Error;

    /// Parse configuration, trying TOML first and JSON second
    fn from_str(content: &str) -> Result<Self> {
        let toml_err = match toml::from_str::<GazeConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        serde_json::from_str::<GazeConfig>(content).map_err(|json_err| {
            Error::Configuration(format!(
                "failed to parse config as TOML ({}) or JSON ({})",
                toml_err.to_string().trim_end(),
                json_err
            ))
        })
    }
}

fn invalid(msg: &str) -> Error {
    Error::Configuration(msg.to_string())
}
