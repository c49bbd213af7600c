//! Command line front end for the instrument console.
//!
//! - `ports`: list serial ports
//! - `monitor`: open a link and print every console event as a JSON line
//! - `send`: send one command and wait for its delivery outcome
//! - `schedule`: run a setpoint schedule to completion
//! - `options`: send the configured motor options, one ack at a time

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use lab_console::config::DEFAULT_CONFIG_FILE;
use lab_console::delivery::DeliveryEvent;
use lab_console::schedule::{BatchEvent, Schedule, ScheduleStep, SequencerEvent};
use lab_console::serial::ReadMode;
use lab_console::{
    ConsoleBuilder, ConsoleConfig, ConsoleEvent, ConsoleHandle, DeviceCommand, LinkManager, MotorOptions,
    SerialLinkConfig, Target,
};

#[derive(Parser, Debug)]
#[command(name = "lab-console")]
#[command(about = "Serial console for pressure and motor controllers")]
#[command(version)]
struct Args {
    /// TOML config file; missing files fall back to defaults
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Serial port; defaults to the first link in the config file
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate, overriding the config file
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,

    /// Print link, delivery and telemetry events until Ctrl-C
    Monitor {
        /// Decode binary device records instead of text lines
        #[arg(long)]
        binary: bool,

        /// Record the link into this directory
        #[arg(long)]
        record: Option<PathBuf>,

        /// Recording file name; empty means a timestamped name
        #[arg(long, default_value = "")]
        record_name: String,
    },

    /// Send one command, e.g. `send pset 300000` or `send opt MSF 400`
    Send {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Run a setpoint schedule
    Schedule {
        /// Step as `<setpoint>[unit]:<dwell>[unit]`, e.g. `3bar:5min`
        #[arg(short, long = "step")]
        steps: Vec<ScheduleStep>,

        /// TOML schedule file with a `[[steps]]` table
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Send the motor options from the `[motor]` config table
    Options {
        /// TOML file with motor options, replacing the config table
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ConsoleConfig::read_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Command::Ports = args.command {
        return list_ports();
    }

    let mut link_config = select_link(&args, &config)?;
    if let Command::Monitor { binary: true, .. } = args.command {
        link_config.read_mode = ReadMode::BinaryDevice;
    }
    let target = Target::port(link_config.port.clone());

    let manager = Arc::new(LinkManager::new());
    let (console, task) = ConsoleBuilder::new(manager.clone()).timing(config.timing.clone()).build();
    manager.connect(link_config).await?;

    let result = match args.command {
        Command::Ports => Ok(()),
        Command::Monitor {
            record, record_name, ..
        } => monitor(&console, &target, record, &record_name).await,
        Command::Send { command } => send(&console, &target, &command.join(" ")).await,
        Command::Schedule { steps, file } => run_schedule(&console, &target, steps, file).await,
        Command::Options { file } => send_options(&console, &target, &config.motor, file).await,
    };

    console.shutdown().await;
    if let Err(e) = task.await {
        log::error!("Console task failed: {}", e);
    }
    manager.shutdown().await;
    result
}

fn list_ports() -> Result<()> {
    let ports = LinkManager::discover_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {:04x}:{:04x}  {}",
                port.port_name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn select_link(args: &Args, config: &ConsoleConfig) -> Result<SerialLinkConfig> {
    let mut link = match &args.port {
        Some(port) => config
            .links
            .iter()
            .find(|link| link.port.eq_ignore_ascii_case(port))
            .cloned()
            .unwrap_or_else(|| SerialLinkConfig::new(port.clone(), args.baud.unwrap_or(9600))),
        None => match config.links.first() {
            Some(link) => link.clone(),
            None => bail!("no port given and none configured in {}", args.config.display()),
        },
    };
    if let Some(baud) = args.baud {
        link.baud = baud;
    }
    Ok(link)
}

fn print_event(event: &ConsoleEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn monitor(console: &ConsoleHandle, target: &Target, record: Option<PathBuf>, record_name: &str) -> Result<()> {
    let mut events = console.subscribe();
    if let Some(dir) = record {
        let paths = console.manager().start_recording(target, &dir, record_name).await?;
        for path in paths {
            log::info!("Recording to {}", path.display());
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event)?;
                    if let ConsoleEvent::Link(lab_console::LinkEvent::Disconnected { .. }) = event {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("{} events skipped", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    console.manager().stop_recording(target).await?;
    Ok(())
}

async fn send(console: &ConsoleHandle, target: &Target, text: &str) -> Result<()> {
    let command: DeviceCommand = text.parse()?;
    let mut events = console.subscribe();

    let Some(id) = console.send_command(target.clone(), command).await? else {
        println!("sent (no acknowledgement expected)");
        return Ok(());
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("console stopped before {} completed", id),
        };
        if let ConsoleEvent::Delivery(delivery) = &event {
            if delivery.id() != id {
                continue;
            }
            print_event(&event)?;
            match delivery {
                DeliveryEvent::Delivered { .. } => return Ok(()),
                DeliveryEvent::Failed { ack_key, .. } => bail!("device never acknowledged {}", ack_key),
                DeliveryEvent::Superseded { .. } | DeliveryEvent::Dropped { .. } => {
                    bail!("command {} was discarded", id)
                }
                DeliveryEvent::Transmit { .. } | DeliveryEvent::Retrying { .. } => {}
            }
        }
    }
}

async fn run_schedule(
    console: &ConsoleHandle,
    target: &Target,
    mut steps: Vec<ScheduleStep>,
    file: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = file {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        steps.extend(Schedule::from_toml(&text)?.steps);
    }
    let schedule = Schedule::new(steps);
    log::info!(
        "Running {} steps, {:?} of dwell in total",
        schedule.steps.len(),
        schedule.total_dwell()
    );

    let mut events = console.subscribe();
    console.start_schedule(target.clone(), schedule.steps).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                console.stop_schedule(target.clone(), false).await?;
                bail!("schedule interrupted");
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if matches!(event, ConsoleEvent::Link(lab_console::LinkEvent::DataReceived { .. })) {
                        continue;
                    }
                    print_event(&event)?;
                    match event {
                        ConsoleEvent::Sequencer(SequencerEvent::Finished { .. }) => return Ok(()),
                        ConsoleEvent::Sequencer(SequencerEvent::Aborted { reason, .. }) => bail!("schedule aborted: {}", reason),
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("{} events skipped", skipped),
                Err(RecvError::Closed) => bail!("console stopped"),
            },
        }
    }
}

async fn send_options(
    console: &ConsoleHandle,
    target: &Target,
    configured: &MotorOptions,
    file: Option<PathBuf>,
) -> Result<()> {
    let options: MotorOptions = match file {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => configured.clone(),
    };

    let mut events = console.subscribe();
    console.start_batch(target.clone(), options.commands()).await?;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("console stopped"),
        };
        if let ConsoleEvent::Batch(batch) = &event {
            print_event(&event)?;
            match batch {
                BatchEvent::Finished { .. } => return Ok(()),
                BatchEvent::Aborted { reason, .. } => bail!("failed to send motor options: {}", reason),
                _ => {}
            }
        }
    }
}
