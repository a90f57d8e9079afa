#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use edge_gateway::{DeviceRole, GatewayConfig, PollIntervals, SerialLink, TelemetryStore};
use image::RgbImage;
use ml_core::{Detection, DetectionEngine};
use video_ingest::{Camera, CameraSource, CaptureError, FrameFormat, RawFrame};

pub const FRAME_SIZE: (u32, u32) = (64, 48);

pub fn test_config(bind: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        bind,
        intervals: PollIntervals {
            camera_reopen: Duration::from_millis(20),
            stream_poll: Duration::from_millis(5),
            ..PollIntervals::default()
        },
        ..GatewayConfig::default()
    }
}

/// A loopback address whose port was free a moment ago.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// In-memory serial transport: tests push bytes in and inspect what the
/// gateway wrote. Dropping `input` reads as EOF on the gateway side.
pub struct MemoryPort {
    pub input: Sender<Vec<u8>>,
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPort {
    pub fn push_line(&self, line: &str) {
        self.input.send(format!("{line}\n").into_bytes()).unwrap();
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

struct ChannelReader(Receiver<Vec<u8>>);

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv_timeout(Duration::from_millis(20)) {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn memory_link(role: DeviceRole, store: &TelemetryStore) -> (SerialLink, MemoryPort) {
    let (tx, rx) = unbounded();
    let written = Arc::new(Mutex::new(Vec::new()));
    let link = SerialLink::from_transport(
        role,
        "memory",
        Box::new(ChannelReader(rx)),
        Box::new(SharedWriter(written.clone())),
        store.clone(),
    )
    .unwrap();
    (link, MemoryPort { input: tx, written })
}

/// Camera that counts opens and releases. Grabs fail until `gate` is set.
pub struct ScriptedCamera {
    pub opens: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub gate: Arc<AtomicBool>,
}

impl ScriptedCamera {
    pub fn new(open_gate: bool) -> Self {
        Self {
            opens: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(AtomicBool::new(open_gate)),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl CameraSource for ScriptedCamera {
    fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            releases: self.releases.clone(),
            gate: self.gate.clone(),
            shade: 0,
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedHandle {
    releases: Arc<AtomicUsize>,
    gate: Arc<AtomicBool>,
    shade: u8,
}

impl Camera for ScriptedHandle {
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        thread::sleep(Duration::from_millis(5));
        if !self.gate.load(Ordering::SeqCst) {
            return Err(CaptureError::EmptyFrame {
                device: "scripted".into(),
            });
        }
        self.shade = self.shade.wrapping_add(1);
        let (width, height) = FRAME_SIZE;
        Ok(RawFrame {
            data: vec![self.shade; RawFrame::expected_len(width, height)],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        })
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Camera that can never be opened.
pub struct MissingCamera;

impl CameraSource for MissingCamera {
    fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
        Err(CaptureError::Open {
            device: "missing".into(),
        })
    }

    fn describe(&self) -> String {
        "missing".into()
    }
}

/// Reports one violation box in the top-left corner of every frame.
pub struct StubEngine;

impl DetectionEngine for StubEngine {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
        Ok(vec![Detection::new("NO-Hardhat", [4.0, 16.0, 30.0, 40.0], 0.9)])
    }

    fn name(&self) -> &str {
        "stub"
    }
}

pub fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(5))
        .build()
}

/// Status code and body of a finished request, error statuses included.
pub fn response_parts(result: Result<ureq::Response, ureq::Error>) -> (u16, String) {
    match result {
        Ok(response) | Err(ureq::Error::Status(_, response)) => {
            let status = response.status();
            (status, response.into_string().unwrap())
        }
        Err(err) => panic!("request failed: {err}"),
    }
}

pub fn get_json(agent: &ureq::Agent, url: &str) -> (u16, serde_json::Value) {
    let (status, body) = response_parts(agent.get(url).call());
    (status, serde_json::from_str(&body).unwrap())
}

pub fn post_json(agent: &ureq::Agent, url: &str, body: &str) -> (u16, serde_json::Value) {
    let result = agent
        .post(url)
        .set("Content-Type", "application/json")
        .send_string(body);
    let (status, body) = response_parts(result);
    (status, serde_json::from_str(&body).unwrap())
}
