//! Detection boxes as drawn on the annotated stream.

use ml_core::Detection;
use serde::Serialize;

/// Labels with this prefix denote a safety violation (e.g. `NO-Hardhat`).
pub const ALERT_PREFIX: &str = "NO-";

pub const SAFE_COLOR: [u8; 3] = [0, 255, 0];
pub const ALERT_COLOR: [u8; 3] = [255, 0, 0];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionBox {
    pub label: String,
    /// Text rendered next to the box: the label without the alert prefix.
    pub text: String,
    pub alert: bool,
    pub score: f32,
    /// `[x1, y1, x2, y2]` in pixels, clamped to the frame.
    pub bbox: [u32; 4],
}

impl DetectionBox {
    /// Convert an engine detection, clamping it to a `width`×`height` frame.
    pub fn from_detection(detection: Detection, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let [x1, y1, x2, y2] = detection.bbox_xyxy;
        let clamp = |value: f32, max: f32| value.clamp(0.0, max).round() as u32;
        let (x1, x2) = (clamp(x1.min(x2), max_x), clamp(x1.max(x2), max_x));
        let (y1, y2) = (clamp(y1.min(y2), max_y), clamp(y1.max(y2), max_y));

        let (alert, text) = match detection.label.strip_prefix(ALERT_PREFIX) {
            Some(rest) => (true, rest.to_string()),
            None => (false, detection.label.clone()),
        };

        Self {
            label: detection.label,
            text,
            alert,
            score: detection.score,
            bbox: [x1, y1, x2, y2],
        }
    }

    /// RGB color for the box and its label.
    pub fn color(&self) -> [u8; 3] {
        if self.alert { ALERT_COLOR } else { SAFE_COLOR }
    }
}
