//! `ffmpeg` child-process capture backend.
//!
//! The child decodes the device and writes packed `bgr24` frames of a fixed
//! size to stdout, so every frame is exactly `width * height * 3` bytes.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::debug;

use crate::{
    Camera, CameraSource, parse_device_index,
    types::{CaptureError, FrameFormat, RawFrame},
};

/// How long `open` waits for the first frame; device negotiation is slow.
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);
/// How long `grab` waits before reporting a stalled device.
const FRAME_TIMEOUT: Duration = Duration::from_secs(1);
const FRAME_QUEUE: usize = 2;

/// Opens a local camera through `ffmpeg`.
#[derive(Clone, Debug)]
pub struct FfmpegCameraSource {
    device: String,
    size: (u32, u32),
    binary: String,
    open_timeout: Duration,
    frame_timeout: Duration,
}

impl FfmpegCameraSource {
    pub fn new(device: impl Into<String>, size: (u32, u32)) -> Self {
        Self {
            device: device.into(),
            size,
            binary: "ffmpeg".to_string(),
            open_timeout: OPEN_TIMEOUT,
            frame_timeout: FRAME_TIMEOUT,
        }
    }

    pub fn from_index(index: i32, size: (u32, u32)) -> Self {
        Self::new(index.to_string(), size)
    }

    /// Use a specific `ffmpeg` executable instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Override how long to wait for the first frame and for each later one.
    pub fn with_timeouts(mut self, open: Duration, frame: Duration) -> Self {
        self.open_timeout = open;
        self.frame_timeout = frame;
        self
    }

    fn command(&self) -> Command {
        let (width, height) = self.size;
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        add_input_args(&mut cmd, &self.device, self.size);
        cmd.arg("-vf")
            .arg(format!("scale={width}:{height}"))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

#[cfg(target_os = "linux")]
fn add_input_args(cmd: &mut Command, device: &str, size: (u32, u32)) {
    let path = match parse_device_index(device) {
        Some(index) => format!("/dev/video{index}"),
        None => device.to_string(),
    };
    cmd.arg("-f")
        .arg("video4linux2")
        .arg("-video_size")
        .arg(format!("{}x{}", size.0, size.1))
        .arg("-i")
        .arg(path);
}

#[cfg(target_os = "macos")]
fn add_input_args(cmd: &mut Command, device: &str, size: (u32, u32)) {
    let input = parse_device_index(device)
        .map(|index| index.to_string())
        .unwrap_or_else(|| device.to_string());
    cmd.arg("-f")
        .arg("avfoundation")
        .arg("-framerate")
        .arg("30")
        .arg("-video_size")
        .arg(format!("{}x{}", size.0, size.1))
        .arg("-i")
        .arg(input);
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn add_input_args(cmd: &mut Command, device: &str, size: (u32, u32)) {
    cmd.arg("-f")
        .arg("dshow")
        .arg("-video_size")
        .arg(format!("{}x{}", size.0, size.1))
        .arg("-i")
        .arg(format!("video={device}"));
}

impl CameraSource for FfmpegCameraSource {
    fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|err| CaptureError::Other(anyhow!("failed to spawn {}: {err}", self.binary)))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
        };

        let (tx, frames) = bounded(FRAME_QUEUE);
        let size = self.size;
        let reader = std::thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || ffmpeg_loop(stdout, size, tx));
        let mut camera = FfmpegCamera {
            child,
            frames,
            device: self.describe(),
            frame_timeout: self.frame_timeout,
            pending: None,
        };
        if let Err(err) = reader {
            return Err(CaptureError::Other(anyhow!("failed to spawn ffmpeg reader: {err}")));
        }

        // ffmpeg starts even when the device is missing; only the first frame tells.
        match camera.next_frame(self.open_timeout) {
            Ok(frame) => {
                camera.pending = Some(frame);
                Ok(Box::new(camera))
            }
            Err(err) => {
                debug!("ffmpeg produced no frame for {}: {err}", self.device);
                Err(CaptureError::Open {
                    device: self.describe(),
                })
            }
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.device)
    }
}

/// Read fixed-size frames from the child's stdout until EOF, a read error or
/// the camera handle going away.
fn ffmpeg_loop(
    mut stdout: ChildStdout,
    size: (u32, u32),
    tx: Sender<Result<RawFrame, CaptureError>>,
) {
    let mut buffer = vec![0u8; RawFrame::expected_len(size.0, size.1)];
    loop {
        let frame = stdout.read_exact(&mut buffer).map(|()| RawFrame {
            data: buffer.clone(),
            width: size.0,
            height: size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        });
        let failed = frame.is_err();
        if tx.send(frame.map_err(CaptureError::from)).is_err() || failed {
            break;
        }
    }
}

struct FfmpegCamera {
    child: Child,
    frames: Receiver<Result<RawFrame, CaptureError>>,
    device: String,
    frame_timeout: Duration,
    pending: Option<RawFrame>,
}

impl FfmpegCamera {
    fn next_frame(&self, timeout: Duration) -> Result<RawFrame, CaptureError> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout {
                device: self.device.clone(),
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Other(anyhow!(
                "ffmpeg for {} exited",
                self.device
            ))),
        }
    }
}

impl Camera for FfmpegCamera {
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.next_frame(self.frame_timeout)
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        // Killing the child closes stdout, which ends the reader thread.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
