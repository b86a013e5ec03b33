//! Environmental Sensor Mesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating a full sensor mesh (gateway + sensors) without hardware
//! - Validating node configuration files before deployment
//! - Smoke-testing the gateway upload path against a real HTTP endpoint

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshsense_core::clock::{NetworkTimeSource, SystemTimeSource};
use meshsense_core::config::NodeConfig;
use meshsense_core::message::{DeviceId, MeasurementRecord};
use meshsense_core::sim::{MeshSimulator, SimConfig, SimTopology};
use meshsense_core::upload::{format_upload_url, UploadPipeline};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

mod http;

use http::BlockingHttpTransport;

#[derive(Parser)]
#[command(name = "meshsense")]
#[command(author, version, about = "Environmental sensor mesh toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    /// Every sensor reaches the gateway directly
    Star,
    /// Sensor k relays through sensor k-1
    Chain,
}

impl From<TopologyArg> for SimTopology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Star => SimTopology::Star,
            TopologyArg::Chain => SimTopology::Chain,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a deterministic mesh simulation and print the network report
    Simulate {
        /// Number of sensor nodes
        #[arg(short, long, default_value = "3")]
        sensors: u8,

        /// How the sensors are wired to the gateway
        #[arg(short, long, value_enum, default_value = "star")]
        topology: TopologyArg,

        /// Per-frame loss probability on the shared medium
        #[arg(short, long, default_value = "0.1")]
        drop_rate: f64,

        /// Seed for reproducible loss (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Virtual run time in milliseconds
        #[arg(long, default_value = "130000")]
        duration_ms: u64,

        /// Print every frame on the wire
        #[arg(long)]
        wire: bool,
    },

    /// Validate a node configuration file
    Check {
        /// JSON configuration file
        config: PathBuf,
    },

    /// Format a sample record and dispatch it to the upload endpoint
    UploadTest {
        /// Override the configured endpoint
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Reporting device id
        #[arg(long, default_value = "5")]
        device: u8,

        /// Sample serial number
        #[arg(long, default_value = "12")]
        serial: u16,

        /// Request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

fn cmd_simulate(
    sensors: u8,
    topology: TopologyArg,
    drop_rate: f64,
    seed: Option<u64>,
    duration_ms: u64,
    wire: bool,
) -> Result<()> {
    let seed = seed.unwrap_or_else(rand::random);
    info!(seed, sensors, drop_rate, "starting simulation");

    let config = SimConfig::default()
        .with_sensors(sensors)
        .with_topology(topology.into())
        .with_drop_rate(drop_rate)
        .with_seed(seed)
        .with_verbose(wire);

    let mut sim = MeshSimulator::new(config);
    sim.run(duration_ms);
    sim.print_summary();
    println!("\nSeed: {} (pass --seed {} to replay)", seed, seed);
    Ok(())
}

fn cmd_check(path: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: NodeConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;

    println!("{} OK", path.display());
    println!("  device: {} ({:?})", config.device_id, config.role);
    println!(
        "  timing: ack_timeout={} ms x {} resends < send_interval={} ms < measure_interval={} ms",
        config.ack_timeout_ms, config.resend_times, config.send_interval_ms, config.measure_interval_ms
    );
    let route = config.topology.route_to_gateway(config.device_id);
    let hops: Vec<String> = route.iter().map(|d| d.to_string()).collect();
    println!("  route to gateway: {}", hops.join(" -> "));
    Ok(())
}

fn cmd_upload_test(
    endpoint: Option<String>,
    device: u8,
    serial: u16,
    timeout_secs: u64,
) -> Result<()> {
    let mut config = NodeConfig::gateway().upload;
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }

    let timestamp_ms = SystemTimeSource
        .network_time_ms()
        .context("reading the system clock")?;
    let record = MeasurementRecord {
        device_id: DeviceId(device),
        serial,
        timestamp_ms,
        battery_voltage: Some(3.87),
        battery_percentage: Some(92.5),
        temperature: Some(21.4),
        pressure: Some(1013.2),
        humidity: Some(61.0),
    };

    println!("{}", format_upload_url(&config, &record));

    let transport = BlockingHttpTransport::new(Duration::from_secs(timeout_secs))
        .context("building the HTTP client")?;
    let mut pipeline = UploadPipeline::new(config, transport);
    let status = pipeline.upload(&record).context("dispatching the upload")?;
    println!("HTTP {}", status);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            sensors,
            topology,
            drop_rate,
            seed,
            duration_ms,
            wire,
        } => cmd_simulate(sensors, topology, drop_rate, seed, duration_ms, wire),
        Commands::Check { config } => cmd_check(config),
        Commands::UploadTest {
            endpoint,
            device,
            serial,
            timeout_secs,
        } => cmd_upload_test(endpoint, device, serial, timeout_secs),
    }
}
