use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Resolution every camera backend is asked to deliver.
pub const DEFAULT_RESOLUTION: (u32, u32) = (640, 480);

/// Uncompressed frame grabbed from a camera.
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
}

impl RawFrame {
    /// Number of bytes a packed three-channel frame of this size occupies.
    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 3
    }

    /// Consume the frame and return tightly packed RGB bytes.
    pub fn into_rgb(self) -> Result<Vec<u8>, CaptureError> {
        let expected = Self::expected_len(self.width, self.height);
        if self.data.len() != expected {
            return Err(CaptureError::FrameSize {
                got: self.data.len(),
                expected,
            });
        }
        match self.format {
            FrameFormat::Rgb8 => Ok(self.data),
            FrameFormat::Bgr8 => Ok(bgr_to_rgb(self.data)),
        }
    }
}

fn bgr_to_rgb(mut data: Vec<u8>) -> Vec<u8> {
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    data
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera {device:?}")]
    Open { device: String },
    #[error("camera {device:?} returned an empty frame")]
    EmptyFrame { device: String },
    #[error("camera {device:?} delivered no frame within {waited:?}")]
    Timeout { device: String, waited: Duration },
    #[error("unexpected frame size: got {got} bytes, expected {expected}")]
    FrameSize { got: usize, expected: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}
