//! CLI entry point for the Sky-Watcher mount driver.
//!
//! # Usage
//!
//! ```bash
//! skywatcher ports
//! skywatcher --port /dev/ttyUSB0 info
//! skywatcher --simulate slew --axis 1 --rate 0.5
//! skywatcher --config mount.toml goto --axis 2 --degrees -10
//! ```
//!
//! Logging is controlled through `RUST_LOG` (default `skywatcher_mount=info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skywatcher_mount::sim::{SimConfig, SimulatedMount};
use skywatcher_mount::{Axis, Mount, MountConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "skywatcher")]
#[command(about = "Sky-Watcher mount motor controller tool", long_about = None)]
struct Cli {
    /// Mount configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to a simulated controller instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Run bring-up and print what was found
    Info,

    /// Slew an axis at a rate
    Slew {
        /// Axis (1 or 2)
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        /// Rate in degrees per second (negative reverses)
        #[arg(long, allow_hyphen_values = true)]
        rate: f64,
        /// Allow high speed mode even in silent mode
        #[arg(long)]
        fast: bool,
    },

    /// Goto relative to the current position
    Goto {
        /// Axis (1 or 2)
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        /// Offset in degrees
        #[arg(long, allow_hyphen_values = true)]
        degrees: f64,
        /// Wait until the axis stops
        #[arg(long)]
        wait: bool,
    },

    /// Stop an axis
    Stop {
        /// Axis (1 or 2)
        #[arg(long, value_parser = parse_axis)]
        axis: Axis,
        /// Stop without deceleration ramp (emergency only)
        #[arg(long)]
        instant: bool,
    },
}

fn parse_axis(s: &str) -> Result<Axis, String> {
    let mut chars = s.chars();
    match (chars.next().and_then(Axis::from_char), chars.next()) {
        (Some(axis), None) => Ok(axis),
        _ => Err(format!("invalid axis '{}', expected 1 or 2", s)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skywatcher_mount=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Ports) {
        return list_ports();
    }

    let mut config = MountConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let mut mount = if cli.simulate {
        tracing::info!("Using simulated mount");
        Mount::with_config(Box::new(SimulatedMount::new(SimConfig::default())), &config)
    } else {
        Mount::connect(&config).await?
    };

    let identity = mount
        .initialize()
        .await
        .context("Mount bring-up failed")?;

    match cli.command {
        Commands::Ports => {}
        Commands::Info => {
            println!("Firmware:  {}", identity.firmware);
            println!("Mount:     {}", identity.family);
            println!("Motor:     {:?}", identity.motor);
            println!("Dialect:   {}", identity.dialect);
            for axis in Axis::ALL {
                let cal = mount.calibration(axis)?;
                let state = mount.axis(axis);
                println!(
                    "Axis {}: {} microsteps/rev, clock {} Hz, high speed x{}, goto margin {}, encoder {}",
                    axis,
                    cal.microsteps_per_revolution(),
                    cal.stepper_clock_frequency(),
                    cal.high_speed_ratio(),
                    cal.low_speed_goto_margin(),
                    state.current_encoder,
                );
            }
        }
        Commands::Slew { axis, rate, fast } => {
            mount.slew_degrees(axis, rate, fast).await?;
            println!("Axis {} slewing at {} deg/s", axis, rate);
        }
        Commands::Goto { axis, degrees, wait } => {
            let offset = mount.calibration(axis)?.degrees_to_microsteps(degrees);
            mount.slew_to(axis, offset, true).await?;
            if wait {
                mount.wait_for_full_stop(axis).await?;
            }
            println!("Axis {} goto {} microsteps", axis, offset);
        }
        Commands::Stop { axis, instant } => {
            if instant {
                mount.instant_stop(axis).await?;
            } else {
                mount.slow_stop(axis).await?;
                mount.wait_for_full_stop(axis).await?;
            }
            println!("Axis {} stopped", axis);
        }
    }

    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = match port.port_type {
            serialport::SerialPortType::UsbPort(info) => format!(
                "USB {:04x}:{:04x} {}",
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            other => format!("{:?}", other),
        };
        println!("{}  {}", port.port_name, detail);
    }
    Ok(())
}
