//! Command line front end: discovery subcommands and the interactive `run`.

use std::{
    io::{self, BufRead},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Sender, unbounded};
use ml_core::DetectionEngine;
use tracing::{error, info, warn};
use video_ingest::CameraSource;

use crate::{
    config::{CAPTURE_SIZE, ModelOptions, RunArgs, RunConfig},
    console::{ConsoleCommand, HELP},
    gateway::Gateway,
    serial,
    store::DeviceRole,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "edge-gateway", version, about = "Serial, camera and detection gateway over HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List serial ports.
    Ports,
    /// Probe camera indices and list the ones that deliver frames.
    Cameras {
        #[arg(long, default_value_t = 5)]
        max: i32,
    },
    /// Connect the devices, start the gateway and read console commands.
    Run(RunArgs),
}

pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ports => {
            telemetry::init_tracing(&Default::default())?;
            print_ports()
        }
        Command::Cameras { max } => {
            telemetry::init_tracing(&Default::default())?;
            let cameras = video_ingest::list_cameras(max);
            if cameras.is_empty() {
                println!("no cameras found");
            }
            for index in cameras {
                println!("camera {index}");
            }
            Ok(())
        }
        Command::Run(args) => {
            let config = RunConfig::try_from(args)?;
            let _guard = telemetry::init_tracing(&config.gateway.telemetry)?;
            run(config)
        }
    }
}

fn print_ports() -> Result<()> {
    let ports = serial::list_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

enum Event {
    Line(String),
    Eof,
    Interrupt,
}

fn run(config: RunConfig) -> Result<()> {
    let engine = load_engine(config.model.as_ref())?;
    let camera: Arc<dyn CameraSource> = Arc::from(video_ingest::default_source(
        config.camera_index,
        CAPTURE_SIZE,
    ));
    let gateway = Gateway::new(config.gateway.clone());

    for (role, port) in [(DeviceRole::A, &config.port_a), (DeviceRole::B, &config.port_b)] {
        if let Some(port) = port {
            if let Err(err) = gateway.links().connect(role, port, config.baud_rate) {
                error!("{role}: {err}");
            }
        }
    }

    gateway
        .start(camera.clone(), engine.clone())
        .context("failed to start gateway")?;

    let (tx, rx) = unbounded();
    let interrupt_tx = tx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(Event::Interrupt);
    }) {
        warn!("failed to install Ctrl+C handler: {err}");
    }
    spawn_stdin_reader(tx)?;
    info!("type `help` for console commands");

    for event in rx.iter() {
        let line = match event {
            Event::Line(line) => line,
            Event::Eof => {
                info!("console closed");
                break;
            }
            Event::Interrupt => {
                info!("interrupted");
                break;
            }
        };
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        handle_command(&gateway, &config, &camera, &engine, command);
    }

    gateway.stop();
    gateway.links().close_all();
    Ok(())
}

fn handle_command(
    gateway: &Gateway,
    config: &RunConfig,
    camera: &Arc<dyn CameraSource>,
    engine: &Option<Arc<dyn DetectionEngine>>,
    command: ConsoleCommand,
) {
    match command {
        ConsoleCommand::Send { role, text } => match gateway.links().send(role, &text) {
            Ok(()) => info!("> Sent: {text}"),
            Err(err) => error!("{err}"),
        },
        ConsoleCommand::Connect { role, port } => {
            match gateway.links().connect(role, &port, config.baud_rate) {
                Ok(()) => println!("{role} connected to {port}"),
                Err(err) => error!("{role}: {err}"),
            }
        }
        ConsoleCommand::Disconnect { role } => gateway.links().disconnect(role),
        ConsoleCommand::Start => {
            if let Err(err) = gateway.start(camera.clone(), engine.clone()) {
                error!("{err}");
            }
        }
        ConsoleCommand::Stop => gateway.stop(),
        ConsoleCommand::Status => print_status(gateway),
        ConsoleCommand::Ports => {
            if let Err(err) = print_ports() {
                error!("{err:#}");
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
}

fn print_status(gateway: &Gateway) {
    match gateway.local_addr() {
        Some(addr) => println!("gateway: running on {addr}"),
        None => println!("gateway: stopped"),
    }
    for role in DeviceRole::ALL {
        let status = gateway.links().status(role);
        let record = gateway.store().get(role);
        println!(
            "{role}: {:?} {} last={:?}",
            status.state,
            status.port.as_deref().unwrap_or("-"),
            record.raw
        );
    }
}

fn spawn_stdin_reader(tx: Sender<Event>) -> Result<()> {
    telemetry::spawn_thread("console", move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(Event::Line(line)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!("failed to read console input: {err}");
                    break;
                }
            }
        }
        let _ = tx.send(Event::Eof);
    })
    .context("failed to spawn console reader")?;
    Ok(())
}

#[cfg(feature = "with-tch")]
fn load_engine(model: Option<&ModelOptions>) -> Result<Option<Arc<dyn DetectionEngine>>> {
    use ml_core::{detector::TorchDetector, tch::Device};

    let Some(model) = model else {
        return Ok(None);
    };
    let device = Device::cuda_if_available();
    let detector = TorchDetector::new(&model.model_path, &model.labels_path, device, model.input_size)
        .with_context(|| format!("failed to load detector {}", model.model_path.display()))?;
    info!("loaded {} on {:?}", model.model_path.display(), detector.device());
    Ok(Some(Arc::new(detector)))
}

#[cfg(not(feature = "with-tch"))]
fn load_engine(model: Option<&ModelOptions>) -> Result<Option<Arc<dyn DetectionEngine>>> {
    if let Some(model) = model {
        warn!(
            "ignoring --model {}: built without the `with-tch` feature",
            model.model_path.display()
        );
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "edge-gateway",
            "run",
            "--port-a",
            "/dev/ttyUSB0",
            "--bind",
            "127.0.0.1:8000",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = RunConfig::try_from(args).unwrap();
        assert_eq!(config.port_a.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.gateway.bind.port(), 8000);
    }

    #[test]
    fn cameras_defaults_to_five_indices() {
        let cli = Cli::try_parse_from(["edge-gateway", "cameras"]).unwrap();
        assert!(matches!(cli.command, Command::Cameras { max: 5 }));
    }
}
