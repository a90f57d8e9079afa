//! TorchScript YOLO detector.
//!
//! Expects an Ultralytics-style export whose output is `[1, 4 + classes, N]`
//! with `cx, cy, w, h` followed by one score per class.

use std::{convert::TryFrom, fs, path::Path, sync::Mutex};

use anyhow::{Context, Result, anyhow, bail};
use image::{RgbImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};

use crate::{Detection, DetectionEngine, non_max_suppression, top_candidates};

/// Candidates kept for NMS, highest scores first.
const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector wrapper.
pub struct TorchDetector {
    // CModule is Send but not Sync.
    module: Mutex<tch::CModule>,
    device: Device,
    input_size: (u32, u32),
    labels: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module and a newline-separated label file.
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: L,
        device: Device,
        input_size: (u32, u32),
    ) -> Result<Self> {
        let labels_path = labels_path.as_ref();
        let labels = fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read labels from {}", labels_path.display()))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if labels.is_empty() {
            bail!("label file {} is empty", labels_path.display());
        }

        let module = tch::CModule::load_on_device(model_path.as_ref(), device)
            .with_context(|| format!("failed to load {}", model_path.as_ref().display()))?;
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size,
            labels,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn to_tensor(&self, image: &RgbImage) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let resized = image::imageops::resize(image, in_w, in_h, FilterType::Triangle);
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl DetectionEngine for TorchDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.to_tensor(image);
        let output = self
            .module
            .lock()
            .map_err(|_| anyhow!("detector module poisoned"))?
            .forward_ts(&[input])?;
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        let channels = shape[1] as usize;
        if channels < 5 {
            bail!("detector output requires at least 5 channels, got {channels}");
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let scale_x = image.width() as f32 / self.input_size.0 as f32;
        let scale_y = image.height() as f32 / self.input_size.1 as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let label = self
                .labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{class_id}"));
            detections.push(Detection::new(
                label,
                [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
                score,
            ));
        }

        let candidates = top_candidates(detections, MAX_DETECTIONS);
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }

    fn name(&self) -> &str {
        "torchscript"
    }
}
