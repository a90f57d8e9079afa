//! Configuration for the gateway and translation from CLI arguments.
//!
//! `GatewayConfig` is what the running gateway needs; `RunConfig` adds the
//! one-shot choices the CLI makes before starting it (serial ports, model).

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;

/// Serial line rate used by both microcontrollers.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Camera resolution requested from every backend.
pub const CAPTURE_SIZE: (u32, u32) = (640, 480);
pub const DEFAULT_BIND: &str = "0.0.0.0:5000";
pub const DEFAULT_DEVICE_A: &str = "m5stack";
pub const DEFAULT_DEVICE_B: &str = "esp32";

#[derive(Clone, Debug)]
/// Settings shared by every component of a running gateway.
pub struct GatewayConfig {
    /// Address the HTTP listener binds to.
    pub bind: SocketAddr,
    /// Name under which role A telemetry is published.
    pub device_a: String,
    /// Name under which role B telemetry is published.
    pub device_b: String,
    /// JPEG quality for raw and annotated frames.
    pub jpeg_quality: u8,
    pub intervals: PollIntervals,
    pub telemetry: TelemetryOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            device_a: DEFAULT_DEVICE_A.to_string(),
            device_b: DEFAULT_DEVICE_B.to_string(),
            jpeg_quality: 80,
            intervals: PollIntervals::default(),
            telemetry: TelemetryOptions::default(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
/// Polling and retry delays for the long-running loops.
pub struct PollIntervals {
    /// Delay between grab attempts after a failed capture.
    pub capture_retry: Duration,
    /// Delay before reopening a camera that failed to open.
    pub camera_reopen: Duration,
    /// Consecutive grab failures before the camera is released and reopened.
    pub max_grab_failures: u32,
    /// Annotator sleep when no new raw frame is available.
    pub annotate_idle: Duration,
    /// Per-client poll interval of the multipart streams.
    pub stream_poll: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            capture_retry: Duration::from_millis(10),
            camera_reopen: Duration::from_secs(1),
            max_grab_failures: 30,
            annotate_idle: Duration::from_millis(10),
            stream_poll: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing loop spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// TorchScript model and label list for the annotated stream.
pub struct ModelOptions {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    /// Detector input size (width, height).
    pub input_size: (u32, u32),
}

#[derive(Clone, Debug)]
/// Everything the `run` subcommand needs.
pub struct RunConfig {
    pub gateway: GatewayConfig,
    pub port_a: Option<String>,
    pub port_b: Option<String>,
    pub baud_rate: u32,
    /// Camera index handed to the capture backend.
    pub camera_index: i32,
    pub model: Option<ModelOptions>,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Serial port of device A (e.g. /dev/ttyUSB0).
    #[arg(long = "port-a", value_name = "PORT")]
    pub port_a: Option<String>,
    /// Serial port of device B.
    #[arg(long = "port-b", value_name = "PORT")]
    pub port_b: Option<String>,
    /// Serial baud rate for both ports.
    #[arg(long = "baud", value_name = "RATE")]
    pub baud: Option<u32>,
    /// Camera index.
    #[arg(long = "camera", value_name = "INDEX")]
    pub camera: Option<i32>,
    /// HTTP listen address.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<String>,
    /// TorchScript detection model.
    #[arg(long = "model", value_name = "PATH", requires = "labels")]
    pub model: Option<PathBuf>,
    /// Newline-separated class labels for the model.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Detector input size in pixels (square).
    #[arg(long = "detector-size", value_name = "PX")]
    pub detector_size: Option<u32>,
    /// JPEG quality for both streams (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<u8>,
    /// Telemetry key for device A.
    #[arg(long = "device-a", value_name = "NAME")]
    pub device_a: Option<String>,
    /// Telemetry key for device B.
    #[arg(long = "device-b", value_name = "NAME")]
    pub device_b: Option<String>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        let bind_text = args.bind.as_deref().unwrap_or(DEFAULT_BIND);
        let bind: SocketAddr = bind_text
            .parse()
            .map_err(|err| anyhow!("--bind must be host:port, got {bind_text:?}: {err}"))?;

        let jpeg_quality = args.jpeg_quality.unwrap_or(80);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let device_a = args.device_a.unwrap_or_else(|| DEFAULT_DEVICE_A.to_string());
        let device_b = args.device_b.unwrap_or_else(|| DEFAULT_DEVICE_B.to_string());
        if device_a.trim().is_empty() || device_b.trim().is_empty() {
            bail!("device names must not be empty");
        }
        if device_a == device_b {
            bail!("device names must differ, both are {device_a:?}");
        }

        let baud_rate = args.baud.unwrap_or(DEFAULT_BAUD_RATE);
        if baud_rate == 0 {
            bail!("--baud must be positive");
        }

        let camera_index = args.camera.unwrap_or(0);
        if camera_index < 0 {
            bail!("--camera must be a non-negative index");
        }

        let detector_size = args.detector_size.unwrap_or(640);
        if detector_size == 0 || detector_size % 32 != 0 {
            bail!("--detector-size must be a positive multiple of 32");
        }

        let model = match (args.model, args.labels) {
            (Some(model_path), Some(labels_path)) => Some(ModelOptions {
                model_path,
                labels_path,
                input_size: (detector_size, detector_size),
            }),
            (None, None) => None,
            (Some(_), None) => bail!("--model requires --labels"),
            (None, Some(_)) => bail!("--labels requires --model"),
        };

        Ok(Self {
            gateway: GatewayConfig {
                bind,
                device_a,
                device_b,
                jpeg_quality,
                intervals: PollIntervals::default(),
                telemetry: TelemetryOptions {
                    chrome_trace_path: args.chrome_trace,
                },
            },
            port_a: non_empty(args.port_a),
            port_b: non_empty(args.port_b),
            baud_rate,
            camera_index,
            model,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
