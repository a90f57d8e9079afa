//! Camera acquisition for the gateway.
//!
//! A [`CameraSource`] knows how to open a device; the [`Camera`] it returns
//! yields one frame per [`Camera::grab`] call and releases the device when
//! dropped. The default backend drives an `ffmpeg` child process; the `opencv`
//! feature adds a `VideoCapture` backend.

#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod types;

pub use ffmpeg::FfmpegCameraSource;
pub use types::{CaptureError, DEFAULT_RESOLUTION, FrameFormat, RawFrame};

/// An opened capture device. Dropping it releases the device.
pub trait Camera: Send {
    /// Wait for the next frame. Backends bound the wait and report a stalled
    /// device as an error.
    fn grab(&mut self) -> Result<RawFrame, CaptureError>;
}

/// Factory for [`Camera`] handles, reopened whenever the capture loop needs to.
pub trait CameraSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn Camera>, CaptureError>;

    /// Human readable device name used in logs.
    fn describe(&self) -> String;
}

/// Build the camera source for `index` using the backend enabled at compile time.
pub fn default_source(index: i32, size: (u32, u32)) -> Box<dyn CameraSource> {
    #[cfg(feature = "opencv")]
    {
        Box::new(camera::OpenCvCameraSource::new(index.to_string(), size))
    }
    #[cfg(not(feature = "opencv"))]
    {
        Box::new(FfmpegCameraSource::from_index(index, size))
    }
}

/// Probe camera indices `0..max` and return the ones that deliver a frame.
pub fn list_cameras(max: i32) -> Vec<i32> {
    (0..max.max(0))
        .filter(|&index| {
            let source = default_source(index, DEFAULT_RESOLUTION);
            match source.open() {
                Ok(mut camera) => camera.grab().is_ok(),
                Err(err) => {
                    tracing::debug!("camera #{index} unavailable: {err}");
                    false
                }
            }
        })
        .collect()
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}
