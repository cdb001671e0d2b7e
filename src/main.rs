//! gridlink - Command line client for the grid control server
//!
//! Uploads and downloads grid topologies, starts and stops the grid and
//! follows device telemetry. Also runs a local server simulator.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridlink::config::{self, Config};
use gridlink::network::{ClientEvent, GridClient, GridSimulator, ServerEvent};
use gridlink::protocol::{self, DeviceType, GridElementConfig, Request, SciBreakAction};

/// gridlink - Grid server command line client
#[derive(Parser)]
#[command(name = "gridlink")]
#[command(author = "GridLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Talk to a power-grid topology control server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server to connect to, as host or host:port
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a status report of the server
    Status {
        /// How long to wait (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Upload a grid configuration from a JSON file
    Upload {
        /// JSON list of grid elements
        file: PathBuf,
    },

    /// Download the grid configuration of the server
    Download {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start the loaded grid
    StartGrid,

    /// Stop the running grid
    StopGrid,

    /// Print the telemetry of one device
    Monitor {
        /// Device type (converter, switchgear, scibreak)
        #[arg(short, long)]
        device: String,

        /// Device id
        #[arg(short, long)]
        id: u16,
    },

    /// Run a grid server simulator
    Simulate {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve configuration parts in reverse order
        #[arg(long)]
        reverse: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose || config.general.verbose, config.general.log_file.as_deref())?;

    match cli.command {
        Commands::Status { timeout } => {
            run_status(&config, cli.server.as_deref(), timeout).await?;
        }
        Commands::Upload { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file.display()))?;
            let configs: Vec<GridElementConfig> = serde_json::from_str(&contents)?;

            let client = connect(&config, cli.server.as_deref()).await?;
            client.upload_grid(&configs).await?;
            println!("Uploaded {} grid elements", configs.len());
            client.disconnect().await?;
        }
        Commands::Download { output } => {
            let client = connect(&config, cli.server.as_deref()).await?;
            let configs = client.fetch_bulk().await?;
            client.disconnect().await?;

            let json = serde_json::to_string_pretty(&configs)?;
            if let Some(path) = output {
                std::fs::write(&path, json)?;
                println!("{} grid elements written to: {}", configs.len(), path.display());
            } else {
                println!("{}", json);
            }
        }
        Commands::StartGrid => {
            let client = connect(&config, cli.server.as_deref()).await?;
            client.start_grid().await?;
            println!("Grid started");
            client.disconnect().await?;
        }
        Commands::StopGrid => {
            let client = connect(&config, cli.server.as_deref()).await?;
            client.stop_grid().await?;
            println!("Grid stopped");
            client.disconnect().await?;
        }
        Commands::Monitor { device, id } => {
            let device_type = DeviceType::from_name(&device.to_lowercase())
                .with_context(|| format!("Unknown device type: {}", device))?;
            run_monitor(&config, cli.server.as_deref(), device_type, id).await?;
        }
        Commands::Simulate { port, reverse } => {
            run_simulator(&config, port, reverse).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

/// Split `host[:port]`, falling back to the configured server
fn server_target(config: &Config, server: Option<&str>) -> anyhow::Result<(String, u16)> {
    let Some(server) = server else {
        return Ok((config.network.server_address.clone(), config.network.port));
    };

    match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in {}", server))?;
            Ok((host.to_string(), port))
        }
        None => Ok((server.to_string(), config.network.port)),
    }
}

async fn connect(config: &Config, server: Option<&str>) -> anyhow::Result<GridClient> {
    let (host, port) = server_target(config, server)?;
    let client = GridClient::new(config.client_config());

    tracing::info!("Connecting to grid server at {}:{}", host, port);
    client
        .connect_hostname(&host, port)
        .await
        .with_context(|| format!("Cannot connect to {}:{}", host, port))?;
    Ok(client)
}

async fn run_status(config: &Config, server: Option<&str>, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(config, server).await?;
    let mut event_rx = client
        .take_event_receiver()
        .context("Event receiver already taken")?;

    let status = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        while let Some(event) = event_rx.recv().await {
            match event {
                ClientEvent::ServerStatus(status) => return Some(status),
                ClientEvent::Disconnected { reason } => {
                    tracing::warn!("Disconnected: {}", reason);
                    return None;
                }
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    match status {
        Some(status) => {
            println!("Server status");
            println!("=============");
            println!("  Connections: {}", status.used_connections);
            println!("  Devices:     {}", status.connected_devices);
            println!("  Load:        {:.2}%", status.load_percent());
            println!("  Grid loaded: {}", status.grid_loaded());
            println!("  Running:     {}", status.grid_started());
            println!("  File:        v{}", status.file_version);
        }
        None => println!("No status report within {} seconds", timeout_secs),
    }

    if let Some(stats) = client.stats().await {
        println!(
            "\nTraffic: {} frames / {} bytes sent, {} frames / {} bytes received",
            stats.frames_sent, stats.bytes_sent, stats.frames_received, stats.bytes_received
        );
    }

    client.disconnect().await?;
    Ok(())
}

fn periodic_request(device_type: DeviceType, device_id: u16, enabled: bool) -> Option<Request> {
    match device_type {
        DeviceType::Converter => Some(Request::ConverterPeriodicData { device_id, enabled }),
        DeviceType::FenSwitchgear => Some(Request::SwitchgearPeriodicData { device_id, enabled }),
        DeviceType::SciBreakBreaker => Some(Request::SciBreakBreaker {
            device_id,
            action: if enabled {
                SciBreakAction::PeriodicDataOn
            } else {
                SciBreakAction::PeriodicDataOff
            },
        }),
        _ => None,
    }
}

async fn run_monitor(
    config: &Config,
    server: Option<&str>,
    device_type: DeviceType,
    device_id: u16,
) -> anyhow::Result<()> {
    let enable = periodic_request(device_type, device_id, true)
        .with_context(|| format!("{:?} devices send no telemetry", device_type))?;

    let client = connect(config, server).await?;
    let mut pushes = client.subscribe(device_type, device_id).await;
    client.execute(enable).await?;

    println!("Monitoring {:?} {}. Press Ctrl+C to stop.\n", device_type, device_id);

    loop {
        tokio::select! {
            push = pushes.recv() => {
                match push {
                    Some(push) => println!("{}", serde_json::to_string(&push)?),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
        }
    }

    if client.is_connected().await {
        if let Some(disable) = periodic_request(device_type, device_id, false) {
            if let Err(e) = client.execute(disable).await {
                tracing::warn!("Cannot disable periodic data: {}", e);
            }
        }
    }
    client.disconnect().await?;
    Ok(())
}

async fn run_simulator(config: &Config, port: Option<u16>, reverse: bool) -> anyhow::Result<()> {
    let mut sim_config = config.simulator_config();
    if let Some(port) = port {
        sim_config.port = port;
    }
    sim_config.reverse_config_parts = reverse;

    let mut simulator = GridSimulator::new(sim_config);
    let mut event_rx = simulator
        .take_event_receiver()
        .context("Event receiver already taken")?;

    let addr = simulator.start().await?;

    println!("\n========================================");
    println!("  gridlink Simulator Running");
    println!("========================================");
    println!("  Address: {}", addr);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr, connection_id } => {
                        println!(
                            "+ Client connected: {} (connection {}, {} connected)",
                            addr,
                            connection_id,
                            simulator.client_count().await
                        );
                    }
                    ServerEvent::ClientDisconnected { addr, reason } => {
                        println!(
                            "- Client disconnected: {} ({}, {} connected)",
                            addr,
                            reason,
                            simulator.client_count().await
                        );
                    }
                    ServerEvent::GridReceived { elements } => {
                        println!("  Grid received: {} elements", elements);
                    }
                    ServerEvent::GridRunning { running } => {
                        println!("  Grid {}", if running { "started" } else { "stopped" });
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    simulator.stop().await?;
    tracing::info!("Simulator stopped");

    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("gridlink Protocol Information");
    println!("=============================\n");

    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Frame Size: {} bytes", protocol::MAX_FRAME_SIZE);
    println!("Frame Alignment: {} bytes", protocol::FRAME_ALIGNMENT);
    println!("Grid Element Size: {} bytes", protocol::ELEMENT_SIZE);
    println!(
        "Elements per Part: {}",
        protocol::max_elements_per_part(protocol::MAX_FRAME_SIZE)
    );
}
