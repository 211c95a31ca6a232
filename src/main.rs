use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serial_gratings::{batch, App, RigConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gratings", about = "Serial-controlled drifting grating stimulus")]
struct Cli {
    /// JSON rig configuration, built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overrides the config file
    #[arg(long, global = true)]
    port: Option<String>,

    #[arg(long, global = true)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fullscreen grating driven by the controller (default)
    Run,
    /// Show the drifting grating without a controller
    Preview {
        #[arg(long)]
        seconds: Option<f64>,
    },
    /// Send START and wait for DONE, no window
    Batch,
    /// List serial ports
    Ports,
}

impl Cli {
    fn rig_config(&self) -> Result<RigConfig> {
        let mut config = match &self.config {
            Some(path) => RigConfig::load(path)?,
            None => RigConfig::default(),
        };
        if let Some(port) = &self.port {
            config.link.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.link.baud_rate = baud;
        }
        Ok(config)
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}  {:?}", port.port_name, port.port_type);
    }
    Ok(())
}

fn preview_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .with_context(|| format!("Invalid preview duration: {seconds} s"))
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("wgpu_hal", log::LevelFilter::Error)
        .filter_module("wgpu_core", log::LevelFilter::Warn)
        .init();

    let cli = Cli::parse();
    let config = cli.rig_config()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("=== SERIAL-CONTROLLED GRATING ===");
            App::interactive(&config)?.run()
        }
        Command::Preview { seconds } => {
            let seconds = seconds.unwrap_or(config.display.preview_duration_sec);
            App::preview(&config, preview_duration(seconds)?).run()
        }
        Command::Batch => {
            info!("Sending command: {}", config.start);
            batch::run_batch(&config.link, &config.start)?;
            Ok(())
        }
        Command::Ports => list_ports(),
    }
}
