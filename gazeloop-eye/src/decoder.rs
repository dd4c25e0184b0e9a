//! Coarse detector output decoding

use gazeloop_core::{Detection, Error, Result};

/// Geometry (cx, cy, w, h) plus objectness confidence.
pub const BOX_FIELDS: usize = 5;

/// Turns a flat detector buffer into detections of one target class.
///
/// The buffer is a run of fixed-stride records laid out as
/// `[cx, cy, w, h, confidence, class_0 .. class_{n-1}]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionDecoder {
    num_classes: usize,
    threshold: f32,
    target_class: usize,
}

impl DetectionDecoder {
    pub fn new(num_classes: usize, threshold: f32, target_class: usize) -> Self {
        Self {
            num_classes,
            threshold,
            target_class,
        }
    }

    pub fn stride(&self) -> usize {
        BOX_FIELDS + self.num_classes
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Decode every record, keeping survivors in buffer order.
    pub fn decode(&self, buffer: &[f32]) -> Result<Vec<Detection>> {
        let stride = self.stride();
        if self.num_classes == 0 {
            return Err(Error::MalformedOutput("decoder configured with zero classes".to_string()));
        }
        if buffer.len() % stride != 0 {
            return Err(Error::MalformedOutput(format!(
                "buffer of {} values is not a multiple of record stride {}",
                buffer.len(),
                stride
            )));
        }

        Ok(buffer
            .chunks_exact(stride)
            .filter_map(|record| self.decode_record(record))
            .collect())
    }

    fn decode_record(&self, record: &[f32]) -> Option<Detection> {
        let confidence = record[4];
        // NaN never passes
        if !(confidence >= self.threshold) {
            return None;
        }

        let scores = &record[BOX_FIELDS..];
        let mut best_class = 0;
        let mut best_score = scores[0];
        for (class_id, &score) in scores.iter().enumerate().skip(1) {
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }

        if best_class != self.target_class || !(best_score >= self.threshold) {
            return None;
        }

        Some(Detection {
            center: (record[0], record[1]),
            size: (record[2], record[3]),
            confidence,
            class_id: best_class,
        })
    }
}
