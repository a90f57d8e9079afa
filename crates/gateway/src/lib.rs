//! Edge gateway bridging two serial microcontrollers and a camera to HTTP.
//!
//! [`Gateway`] owns the long-running loops: serial readers publish telemetry
//! into a [`TelemetryStore`], the capture loop fills the raw frame slot, the
//! annotator runs a [`ml_core::DetectionEngine`] over it, and an Actix Web
//! server exposes all of it.

mod annotation;
pub mod annotator;
pub mod capture;
pub mod cli;
pub mod config;
pub mod console;
pub mod detection;
pub mod frames;
pub mod gateway;
pub mod router;
pub mod serial;
mod server;
pub mod store;
pub mod telemetry;
mod worker;

pub use annotator::Annotator;
pub use capture::FrameSource;
pub use config::{GatewayConfig, PollIntervals};
pub use detection::DetectionBox;
pub use frames::{AnnotatedFrame, Frame, FrameSlot};
pub use gateway::{Gateway, GatewayError, GatewayState};
pub use router::{CommandError, CommandRouter};
pub use serial::{ConnectError, LinkSet, LinkState, LinkStatus, SendError, SerialLink};
pub use store::{DeviceRole, TelemetryRecord, TelemetryStore};
