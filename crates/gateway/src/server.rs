//! Actix Web server exposing telemetry, command, and video routes.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! capture and serial loops never share a runtime with request handling.
//! Streams poll the frame slots and end as soon as the gateway stops.

use std::{
    collections::BTreeMap,
    net::{SocketAddr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::{Method, header},
    middleware::DefaultHeaders,
    web::{self, Bytes},
};
use async_stream::stream;
use crossbeam_channel::bounded;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    detection::DetectionBox,
    frames::{AnnotatedFrame, Frame, FrameSlot},
    router::{CommandError, CommandRouter},
    serial::{LinkSet, LinkStatus},
    store::{DeviceRole, TelemetryRecord, TelemetryStore},
    telemetry,
};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) store: TelemetryStore,
    pub(crate) links: LinkSet,
    pub(crate) router: CommandRouter,
    /// Telemetry keys for roles A and B.
    pub(crate) device_names: [String; 2],
    pub(crate) raw: FrameSlot<Frame>,
    /// `None` when no detection engine is configured.
    pub(crate) annotated: Option<FrameSlot<AnnotatedFrame>>,
    pub(crate) camera_ready: Arc<AtomicBool>,
    /// Cleared on shutdown so open streams finish.
    pub(crate) streaming: Arc<AtomicBool>,
    pub(crate) stream_poll: Duration,
}

impl ServerState {
    fn device_name(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::A => &self.device_names[0],
            DeviceRole::B => &self.device_names[1],
        }
    }
}

/// Handle for the server thread.
pub(crate) struct HttpServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HttpServerHandle {
    /// Signal the server to stop and block until its thread (and socket) is gone.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Serve on an already bound `listener` from a dedicated thread. Returns once
/// the server accepts connections.
pub(crate) fn spawn_http_server(
    listener: TcpListener,
    state: ServerState,
) -> anyhow::Result<HttpServerHandle> {
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let data = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

    let handle = telemetry::spawn_thread("http-server", move || {
        let span = tracing::info_span!("http.server", %addr);
        let _enter = span.enter();
        let result = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(data.clone())
                    .wrap(cors_headers())
                    .configure(routes)
            })
            .workers(2)
            .disable_signals()
            .shutdown_timeout(1)
            .listen(listener);
            let server = match server {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });
            let _ = ready_tx.send(Ok(()));
            server.await
        });
        match result {
            Ok(()) => info!("HTTP server stopped"),
            Err(err) => error!("HTTP server error: {err}"),
        }
    })?;

    let server = HttpServerHandle {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    };
    match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
        Ok(Ok(())) => Ok(server),
        Ok(Err(err)) => {
            server.stop();
            anyhow::bail!("HTTP server on {addr} failed to start: {err}")
        }
        Err(_) => {
            server.stop();
            anyhow::bail!("HTTP server on {addr} did not start")
        }
    }
}

fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/sensors", web::get().to(sensors_handler))
        .route("/portA", web::post().to(port_a_handler))
        .route("/portB", web::post().to(port_b_handler))
        .route("/video_raw", web::get().to(raw_stream_handler))
        .route("/video_yolo", web::get().to(annotated_stream_handler))
        .route("/status", web::get().to(status_handler))
        .route("/detections", web::get().to(detections_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .default_service(web::to(fallback_handler));
}

/// Latest telemetry of both devices keyed by device name.
async fn sensors_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.store.snapshot();
    let body: BTreeMap<&str, &TelemetryRecord> = snapshot
        .iter()
        .map(|(role, record)| (state.device_name(*role), record.as_ref()))
        .collect();
    HttpResponse::Ok().json(body)
}

async fn port_a_handler(
    state: web::Data<ServerState>,
    body: Bytes,
) -> Result<HttpResponse, CommandError> {
    let accepted = state.router.dispatch(DeviceRole::A, &body)?;
    Ok(HttpResponse::Ok().json(accepted))
}

async fn port_b_handler(
    state: web::Data<ServerState>,
    body: Bytes,
) -> Result<HttpResponse, CommandError> {
    let accepted = state.router.dispatch(DeviceRole::B, &body)?;
    Ok(HttpResponse::Ok().json(accepted))
}

async fn raw_stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let slot = state.raw.clone();
    mjpeg_response(state, "raw", move || slot.latest())
}

async fn annotated_stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.annotated.clone() {
        Some(slot) => mjpeg_response(state, "annotated", move || {
            slot.latest().map(|annotated| annotated.frame)
        }),
        None => annotation_unavailable(),
    }
}

fn annotation_unavailable() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(json!({ "error": "annotation unavailable" }))
}

/// Tracks one connected stream client in the `gateway_stream_clients` gauge.
struct StreamClient(&'static str);

impl StreamClient {
    fn connect(stream: &'static str) -> Self {
        metrics::gauge!("gateway_stream_clients", "stream" => stream).increment(1.0);
        Self(stream)
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        metrics::gauge!("gateway_stream_clients", "stream" => self.0).decrement(1.0);
    }
}

/// Stream the newest frame from `latest` as multipart JPEG parts.
///
/// Nothing is emitted until a frame exists; a frame is sent at most once per
/// client, and frames produced between polls are skipped.
fn mjpeg_response<F>(state: web::Data<ServerState>, name: &'static str, latest: F) -> HttpResponse
where
    F: Fn() -> Option<Frame> + 'static,
{
    let streaming = state.streaming.clone();
    let poll = state.stream_poll;
    let stream = stream! {
        let _client = StreamClient::connect(name);
        let mut last_sequence = None;
        let mut interval = actix_web::rt::time::interval(poll);
        while streaming.load(Ordering::Relaxed) {
            interval.tick().await;
            if let Some(frame) = latest() {
                if Some(frame.sequence) != last_sequence {
                    last_sequence = Some(frame.sequence);
                    yield Ok::<Bytes, actix_web::Error>(multipart_part(&frame.jpeg));
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .content_type(MULTIPART_CONTENT_TYPE)
        .streaming(stream)
}

pub(crate) fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 48);
    payload.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

#[derive(Serialize)]
struct LinkReport<'a> {
    device: &'a str,
    #[serde(flatten)]
    status: LinkStatus,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    links: BTreeMap<&'static str, LinkReport<'a>>,
    camera_ready: bool,
    annotation: &'static str,
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let links = DeviceRole::ALL
        .into_iter()
        .map(|role| {
            let report = LinkReport {
                device: state.device_name(role),
                status: state.links.status(role),
            };
            (role.label(), report)
        })
        .collect();
    HttpResponse::Ok().json(StatusResponse {
        links,
        camera_ready: state.camera_ready.load(Ordering::Relaxed),
        annotation: if state.annotated.is_some() {
            "enabled"
        } else {
            "unavailable"
        },
    })
}

#[derive(Serialize)]
struct DetectionsResponse<'a> {
    sequence: u64,
    timestamp_ms: i64,
    detections: &'a [DetectionBox],
}

/// Detections drawn on the latest annotated frame.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    let Some(slot) = state.annotated.as_ref() else {
        return annotation_unavailable();
    };
    match slot.latest() {
        Some(annotated) => HttpResponse::Ok().json(DetectionsResponse {
            sequence: annotated.frame.sequence,
            timestamp_ms: annotated.frame.timestamp_ms,
            detections: &annotated.detections,
        }),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

async fn fallback_handler(req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        HttpResponse::NoContent().finish()
    } else {
        HttpResponse::NotFound().json(json!({ "error": "not found" }))
    }
}

/// URLs of the public routes for a server bound to `addr`, using `host` in
/// place of an unspecified bind address.
pub(crate) fn endpoint_urls(addr: SocketAddr, host: std::net::IpAddr) -> Vec<String> {
    let ip = if addr.ip().is_unspecified() { host } else { addr.ip() };
    let base = SocketAddr::new(ip, addr.port());
    ["sensors", "portA", "portB", "video_raw", "video_yolo"]
        .iter()
        .map(|path| format!("http://{base}/{path}"))
        .collect()
}
