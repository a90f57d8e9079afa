//! Serial links to the two microcontrollers.
//!
//! Each link owns its transport: a reader thread turns incoming lines into
//! telemetry snapshots, and [`SerialLink::send`] writes newline-terminated
//! commands. A transport error ends the reader and leaves the link
//! [`LinkState::Disconnected`] until it is explicitly reconnected.

use std::{
    io::{self, Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use serde::Serialize;
use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    store::{DeviceRole, TelemetryRecord, TelemetryStore},
    worker::Worker,
};

/// Upper bound on a single blocking read.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Lines longer than this are discarded.
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("failed to clone serial port {port}: {source}")]
    Clone {
        port: String,
        source: serialport::Error,
    },
    #[error("failed to start reader for {port}: {source}")]
    Spawn { port: String, source: io::Error },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("{0} is not connected")]
    NotConnected(DeviceRole),
    #[error("write to {role} failed: {source}")]
    Write { role: DeviceRole, source: io::Error },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// An open connection to one device.
pub struct SerialLink {
    role: DeviceRole,
    port: String,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    connected: Arc<AtomicBool>,
    reader: Worker,
}

impl SerialLink {
    /// Open `port` at `baud_rate` and start reading telemetry for `role`.
    pub fn connect(
        port: &str,
        baud_rate: u32,
        role: DeviceRole,
        store: TelemetryStore,
    ) -> Result<Self, ConnectError> {
        let reader = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| ConnectError::Open {
                port: port.to_string(),
                source,
            })?;
        let writer = reader.try_clone().map_err(|source| ConnectError::Clone {
            port: port.to_string(),
            source,
        })?;
        let link = Self::from_transport(
            role,
            port,
            Box::new(PortIo(reader)),
            Box::new(PortIo(writer)),
            store,
        )?;
        info!("{role} connected to {port} at {baud_rate} baud");
        Ok(link)
    }

    /// Build a link over an arbitrary transport. Reads must return within a
    /// bounded time (`TimedOut`/`WouldBlock` are treated as "no data yet").
    pub fn from_transport(
        role: DeviceRole,
        port: &str,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        store: TelemetryStore,
    ) -> Result<Self, ConnectError> {
        let connected = Arc::new(AtomicBool::new(true));
        let loop_connected = connected.clone();
        let loop_port = port.to_string();
        let worker = Worker::spawn(&format!("serial-{}", role.label()), move |running| {
            read_loop(running, role, loop_port, reader, store, loop_connected)
        })
        .map_err(|source| ConnectError::Spawn {
            port: port.to_string(),
            source,
        })?;
        Ok(Self {
            role,
            port: port.to_string(),
            writer: Mutex::new(Some(writer)),
            connected,
            reader: worker,
        })
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> LinkState {
        if self.connected.load(Ordering::SeqCst) {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    /// Write `command` plus a newline. Does not wait for any reply.
    pub fn send(&self, command: &str) -> Result<(), SendError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = match guard.as_mut() {
            Some(writer) if self.state() == LinkState::Connected => writer,
            _ => return Err(SendError::NotConnected(self.role)),
        };
        let mut payload = Vec::with_capacity(command.len() + 1);
        payload.extend_from_slice(command.as_bytes());
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .and_then(|()| writer.flush())
            .map_err(|source| SendError::Write {
                role: self.role,
                source,
            })
    }

    /// Stop the reader and release the transport. Idempotent.
    pub fn close(&self) {
        self.reader.stop();
        self.connected.store(false, Ordering::SeqCst);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if writer.is_some() {
            info!("{} disconnected from {}", self.role, self.port);
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adapts a serial port handle to plain `Read`/`Write` trait objects.
struct PortIo(Box<dyn SerialPort>);

impl Read for PortIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn read_loop(
    running: Arc<AtomicBool>,
    role: DeviceRole,
    port: String,
    mut reader: Box<dyn Read + Send>,
    store: TelemetryStore,
    connected: Arc<AtomicBool>,
) {
    let span = tracing::info_span!("serial.reader", role = role.label(), port = %port);
    let _enter = span.enter();

    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 256];
    while running.load(Ordering::Relaxed) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                warn!("serial port closed by peer");
                break;
            }
            Ok(n) => {
                lines.extend(&chunk[..n]);
                while let Some(line) = lines.next_line() {
                    if line.is_empty() {
                        continue;
                    }
                    debug!("<- {line}");
                    let record = TelemetryRecord::from_line(role, &store.get(role), &line);
                    store.set(role, record);
                    metrics::counter!("gateway_serial_lines_total", "device" => role.label())
                        .increment(1);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!("serial read failed, link disconnected: {err}");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// Reassembles newline-terminated lines from arbitrary read chunks.
///
/// A line longer than `MAX_LINE_LEN` is dropped as a whole: once the limit is
/// crossed, bytes are skipped up to and including the next `\n`.
struct LineBuffer {
    pending: BytesMut,
    discarding: bool,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(256),
            discarding: false,
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line, decoded lossily with invalid sequences dropped and
    /// surrounding whitespace trimmed.
    fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(end) = self.pending.iter().position(|&b| b == b'\n') else {
                if self.discarding || self.pending.len() > MAX_LINE_LEN {
                    if !self.discarding {
                        warn!("discarding line longer than {MAX_LINE_LEN} bytes");
                    }
                    self.discarding = true;
                    self.pending.clear();
                }
                return None;
            };
            let line = self.pending.split_to(end + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if end > MAX_LINE_LEN {
                warn!("discarding line longer than {MAX_LINE_LEN} bytes");
                continue;
            }
            let text = String::from_utf8_lossy(&line).replace(char::REPLACEMENT_CHARACTER, "");
            return Some(text.trim().to_string());
        }
    }
}

/// Status of one role's link as reported by `/status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub port: Option<String>,
}

/// The gateway's two link slots. Replacing a link closes the previous one.
#[derive(Clone)]
pub struct LinkSet {
    links: Arc<[Mutex<Option<SerialLink>>; 2]>,
    store: TelemetryStore,
}

impl LinkSet {
    pub fn new(store: TelemetryStore) -> Self {
        Self {
            links: Arc::new([Mutex::new(None), Mutex::new(None)]),
            store,
        }
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    /// (Re)connect `role` to `port`. Any existing link for the role is closed
    /// first so the same port can be reopened.
    pub fn connect(&self, role: DeviceRole, port: &str, baud_rate: u32) -> Result<(), ConnectError> {
        self.disconnect(role);
        let link = SerialLink::connect(port, baud_rate, role, self.store.clone())?;
        *self.slot(role) = Some(link);
        Ok(())
    }

    /// Install an already built link, closing whatever held the slot before.
    pub fn attach(&self, link: SerialLink) {
        let previous = self.slot(link.role()).replace(link);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub fn disconnect(&self, role: DeviceRole) {
        let previous = self.slot(role).take();
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub fn send(&self, role: DeviceRole, command: &str) -> Result<(), SendError> {
        match self.slot(role).as_ref() {
            Some(link) => link.send(command),
            None => Err(SendError::NotConnected(role)),
        }
    }

    pub fn status(&self, role: DeviceRole) -> LinkStatus {
        match self.slot(role).as_ref() {
            Some(link) => LinkStatus {
                state: link.state(),
                port: Some(link.port().to_string()),
            },
            None => LinkStatus {
                state: LinkState::Disconnected,
                port: None,
            },
        }
    }

    /// Close both links.
    pub fn close_all(&self) {
        for role in DeviceRole::ALL {
            self.disconnect(role);
        }
    }

    fn slot(&self, role: DeviceRole) -> std::sync::MutexGuard<'_, Option<SerialLink>> {
        let index = match role {
            DeviceRole::A => 0,
            DeviceRole::B => 1,
        };
        self.links[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> Result<Vec<String>, serialport::Error> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect())
}
