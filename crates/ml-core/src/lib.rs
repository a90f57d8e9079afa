//! Object-detection contract consumed by the gateway's annotator.
//!
//! Engines are black boxes: one RGB image in, zero or more labelled boxes
//! out. The `with-tch` feature adds a TorchScript YOLO backend.

use anyhow::Result;
use image::RgbImage;

#[cfg(feature = "with-tch")]
pub mod detector;

#[cfg(feature = "with-tch")]
pub use tch;

/// Single detection returned by an engine, in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    /// `[x1, y1, x2, y2]`.
    pub bbox_xyxy: [f32; 4],
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox_xyxy: [f32; 4], score: f32) -> Self {
        Self {
            label: label.into(),
            bbox_xyxy,
            score,
        }
    }

    fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox_xyxy;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }
}

/// Synchronous detection capability shared across threads.
pub trait DetectionEngine: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "detector"
    }
}

/// Intersection-over-union of two `xyxy` boxes.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.bbox_xyxy[0].max(b.bbox_xyxy[0]);
    let y1 = a.bbox_xyxy[1].max(b.bbox_xyxy[1]);
    let x2 = a.bbox_xyxy[2].min(b.bbox_xyxy[2]);
    let y2 = a.bbox_xyxy[3].min(b.bbox_xyxy[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Keep the `max` highest-scoring detections, best first.
pub fn top_candidates(mut detections: Vec<Detection>, max: usize) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    detections.truncate(max);
    detections
}

/// Greedy per-label non-maximum suppression, highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.label == candidate.label && iou(k, &candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = Detection::new("Person", [0.0, 0.0, 10.0, 10.0], 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Detection::new("Person", [0.0, 0.0, 10.0, 10.0], 0.9);
        let b = Detection::new("Person", [20.0, 20.0, 30.0, 30.0], 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn nms_keeps_best_overlapping_box_per_label() {
        let detections = vec![
            Detection::new("Hardhat", [0.0, 0.0, 10.0, 10.0], 0.6),
            Detection::new("Hardhat", [1.0, 1.0, 10.0, 10.0], 0.9),
            Detection::new("NO-Mask", [1.0, 1.0, 10.0, 10.0], 0.5),
            Detection::new("Hardhat", [50.0, 50.0, 60.0, 60.0], 0.4),
        ];
        let kept = non_max_suppression(detections, 0.45);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].score, 0.9);
        assert!(kept.iter().any(|d| d.label == "NO-Mask"));
        assert!(kept.iter().all(|d| d.score != 0.6));
    }

    #[test]
    fn candidate_cap_keeps_the_best_scores_regardless_of_order() {
        let mut detections: Vec<Detection> = (0..10)
            .map(|i| Detection::new("Person", [i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0], 0.3))
            .collect();
        detections.push(Detection::new("NO-Hardhat", [0.0, 50.0, 10.0, 60.0], 0.95));

        let kept = top_candidates(detections, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].label, "NO-Hardhat");
        assert!(kept[1..].iter().all(|d| d.score == 0.3));
    }
}
