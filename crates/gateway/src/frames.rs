//! Encoded frames and the last-write-wins slots that hold them.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use image::{RgbImage, codecs::jpeg::JpegEncoder};

use crate::detection::DetectionBox;

/// One captured (or annotated) image.
///
/// `jpeg` is what HTTP clients receive; `image` keeps the decoded pixels so
/// the annotator does not have to decode the JPEG again.
#[derive(Clone, Debug)]
pub struct Frame {
    pub jpeg: Bytes,
    pub image: Arc<RgbImage>,
    /// Capture sequence number, shared by a raw frame and its annotation.
    pub sequence: u64,
    pub timestamp_ms: i64,
}

impl Frame {
    /// Encode `image` as JPEG and wrap it.
    pub fn encode(image: RgbImage, sequence: u64, timestamp_ms: i64, quality: u8) -> Result<Self> {
        let jpeg = encode_jpeg(&image, quality)?;
        Ok(Self {
            jpeg,
            image: Arc::new(image),
            sequence,
            timestamp_ms,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// An annotated frame together with the boxes drawn on it.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: Arc<[DetectionBox]>,
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(Bytes::from(buffer))
}

/// Single-item holder: each `publish` discards the previous value.
pub struct FrameSlot<T> {
    latest: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for FrameSlot<T> {
    fn clone(&self) -> Self {
        Self {
            latest: self.latest.clone(),
        }
    }
}

impl<T: Clone> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn publish(&self, value: T) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Non-blocking read of the current value; `None` before the first publish.
    pub fn latest(&self) -> Option<T> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
