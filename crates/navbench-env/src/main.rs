//! Environment node binary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, Level};

use navbench_core::bus::BusClient;
use navbench_core::codec::InputModality;
use navbench_core::config::{SimMode, TaskConfig};
use navbench_core::telemetry::init_tracing;
use navbench_env::{EnvNode, PlanarSim};

#[derive(Parser)]
#[command(name = "navbench-env")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "navbench environment node", long_about = None)]
struct Cli {
    /// Bus address to connect to
    #[arg(long)]
    bus: String,

    /// Task configuration file (TOML)
    #[arg(long)]
    task_config: std::path::PathBuf,

    /// Sensor suite to publish: blind, rgb, depth or rgbd
    #[arg(long, default_value = "rgbd")]
    input_type: InputModality,

    /// Override the configured sensor publication rate (Hz)
    #[arg(long)]
    sensor_pub_rate: Option<f64>,

    /// Run with physics integration (requires a continuous-mode task)
    #[arg(long)]
    enable_physics: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let mut config = TaskConfig::from_file(&cli.task_config)
        .with_context(|| format!("loading task config {}", cli.task_config.display()))?;
    if let Some(rate) = cli.sensor_pub_rate {
        config.sensor_pub_rate = rate;
        config.validate().context("sensor rate override")?;
    }
    if cli.enable_physics != (config.mode == SimMode::Continuous) {
        bail!("--enable-physics must match a continuous-mode task config");
    }

    let bus = BusClient::connect(&cli.bus)
        .await
        .with_context(|| format!("connecting to bus at {}", cli.bus))?;
    let sim = Box::new(PlanarSim::new(config.resolution));
    let node = EnvNode::new(bus, sim, config, cli.input_type)?;

    info!(event = "env.ready", bus = %cli.bus);
    node.run().await?;
    info!(event = "env.stopped");
    Ok(())
}
