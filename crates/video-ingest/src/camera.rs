//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    Camera, CameraSource, parse_device_index,
    types::{CaptureError, FrameFormat, RawFrame},
};

/// Opens a camera by index or URI through `VideoCapture`.
#[derive(Clone, Debug)]
pub struct OpenCvCameraSource {
    uri: String,
    size: (u32, u32),
}

impl OpenCvCameraSource {
    pub fn new(uri: impl Into<String>, size: (u32, u32)) -> Self {
        Self {
            uri: uri.into(),
            size,
        }
    }
}

impl CameraSource for OpenCvCameraSource {
    fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.size, 30.0);
        Ok(Box::new(OpenCvCamera {
            cap,
            uri: self.uri.clone(),
            size: self.size,
            frame: Mat::default(),
            scratch: Mat::default(),
        }))
    }

    fn describe(&self) -> String {
        format!("opencv:{}", self.uri)
    }
}

struct OpenCvCamera {
    cap: VideoCapture,
    uri: String,
    size: (u32, u32),
    frame: Mat,
    scratch: Mat,
}

impl Camera for OpenCvCamera {
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 {
            return Err(CaptureError::EmptyFrame {
                device: self.uri.clone(),
            });
        }

        let (target_w, target_h) = (self.size.0 as i32, self.size.1 as i32);
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(RawFrame {
            data,
            width: self.size.0,
            height: self.size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("failed to release camera {}: {err}", self.uri);
        }
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    tracing::debug!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                tracing::debug!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        device: uri.to_string(),
    })
}

/// Request the capture resolution and an MJPG pixel format where supported.
fn configure_camera(cap: &mut VideoCapture, size: (u32, u32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
