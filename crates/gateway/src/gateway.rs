//! Gateway lifecycle: owns the capture and annotation loops and the HTTP
//! listener while running.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ml_core::DetectionEngine;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use video_ingest::CameraSource;

use crate::{
    annotator::Annotator,
    capture::FrameSource,
    config::GatewayConfig,
    router::CommandRouter,
    serial::LinkSet,
    server::{HttpServerHandle, ServerState, endpoint_urls, spawn_http_server},
    store::TelemetryStore,
    telemetry,
};

const BIND_RETRIES: u32 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to start {component} thread: {source}")]
    Spawn {
        component: &'static str,
        source: io::Error,
    },
    #[error(transparent)]
    Server(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Stopped,
    Running,
}

/// Resources that exist only while the gateway runs.
struct Running {
    addr: SocketAddr,
    capture: FrameSource,
    annotator: Option<Annotator>,
    server: HttpServerHandle,
    streaming: Arc<AtomicBool>,
}

/// The edge gateway. Serial links and telemetry outlive start/stop cycles;
/// the camera, detection loop and listener are acquired by `start` and
/// released by `stop`.
pub struct Gateway {
    config: GatewayConfig,
    store: TelemetryStore,
    links: LinkSet,
    running: Mutex<Option<Running>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let store = TelemetryStore::new();
        let links = LinkSet::new(store.clone());
        Self {
            config,
            store,
            links,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn links(&self) -> &LinkSet {
        &self.links
    }

    pub fn state(&self) -> GatewayState {
        if self.lock().is_some() {
            GatewayState::Running
        } else {
            GatewayState::Stopped
        }
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|running| running.addr)
    }

    /// Start capture, annotation (when `engine` is given) and the HTTP server.
    ///
    /// Calling `start` while running returns the current address without
    /// touching anything. A bind failure leaves the gateway stopped.
    pub fn start(
        &self,
        camera: Arc<dyn CameraSource>,
        engine: Option<Arc<dyn DetectionEngine>>,
    ) -> Result<SocketAddr, GatewayError> {
        let mut running = self.lock();
        if let Some(current) = running.as_ref() {
            info!("gateway already running on {}", current.addr);
            return Ok(current.addr);
        }
        telemetry::init_metrics_recorder();

        let listener = bind_listener(self.config.bind).map_err(|source| GatewayError::Bind {
            addr: self.config.bind,
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: self.config.bind,
            source,
        })?;

        let intervals = self.config.intervals;
        let quality = self.config.jpeg_quality;
        info!("starting capture from {}", camera.describe());
        let capture = FrameSource::start(camera, quality, intervals).map_err(|source| {
            GatewayError::Spawn {
                component: "capture",
                source,
            }
        })?;
        let annotator = match engine {
            Some(engine) => {
                info!("annotating with {}", engine.name());
                let annotator = Annotator::start(engine, capture.slot(), quality, intervals)
                    .map_err(|source| GatewayError::Spawn {
                        component: "annotator",
                        source,
                    })?;
                Some(annotator)
            }
            None => {
                warn!("no detection engine configured, /video_yolo is unavailable");
                None
            }
        };

        let streaming = Arc::new(AtomicBool::new(true));
        let state = ServerState {
            store: self.store.clone(),
            links: self.links.clone(),
            router: CommandRouter::new(self.links.clone()),
            device_names: [self.config.device_a.clone(), self.config.device_b.clone()],
            raw: capture.slot(),
            annotated: annotator.as_ref().map(Annotator::slot),
            camera_ready: capture.ready_flag(),
            streaming: streaming.clone(),
            stream_poll: intervals.stream_poll,
        };
        let server = match spawn_http_server(listener, state) {
            Ok(server) => server,
            Err(err) => {
                if let Some(annotator) = &annotator {
                    annotator.stop();
                }
                capture.stop();
                return Err(err.into());
            }
        };

        info!("gateway listening on {addr}");
        let host = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        for url in endpoint_urls(addr, host) {
            info!("  {url}");
        }

        *running = Some(Running {
            addr,
            capture,
            annotator,
            server,
            streaming,
        });
        Ok(addr)
    }

    /// Stop every loop, release the camera and close the listener. Safe to call
    /// from any thread and when already stopped.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let Some(running) = guard.take() else {
            return;
        };
        running.streaming.store(false, Ordering::SeqCst);
        if let Some(annotator) = &running.annotator {
            annotator.stop();
        }
        running.capture.stop();
        running.server.stop();
        info!("gateway on {} stopped", running.addr);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
        self.links.close_all();
    }
}

/// Bind `addr`, retrying briefly while a listener closed by a previous `stop`
/// is still being released by the server's acceptor thread.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind(addr) {
            Err(err) if err.kind() == io::ErrorKind::AddrInUse && attempt < BIND_RETRIES => {
                attempt += 1;
                thread::sleep(BIND_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

/// Address of the interface that routes to the outside world. No packet is
/// sent: connecting a UDP socket only selects the route.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
