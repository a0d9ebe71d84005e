//! Agent node binary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, Level};

use navbench_agent::{AgentConfig, AgentNode, GoalSeekPolicy};
use navbench_core::bus::BusClient;
use navbench_core::codec::InputModality;
use navbench_core::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "navbench-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "navbench agent node", long_about = None)]
struct Cli {
    /// Bus address to connect to
    #[arg(long)]
    bus: String,

    /// Sensor suite to consume: blind, rgb, depth or rgbd
    #[arg(long, default_value = "rgbd")]
    input_type: InputModality,

    /// Policy checkpoint to load (reference goal-seek policy when omitted)
    #[arg(long)]
    model_path: Option<std::path::PathBuf>,

    /// Sensor publication rate of the environment node (Hz)
    #[arg(long, default_value_t = 5.0)]
    sensor_pub_rate: f64,

    /// Control period in continuous mode (seconds)
    #[arg(long, default_value_t = 1.0)]
    control_period: f64,

    /// Publish velocity commands instead of discrete actions
    #[arg(long)]
    continuous: bool,

    /// Distance at which the reference policy stops
    #[arg(long, default_value_t = 0.2)]
    stop_distance: f32,

    /// Synchronizer queue size
    #[arg(long, default_value_t = 10)]
    queue_size: usize,

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

    if let Some(path) = &cli.model_path {
        bail!(
            "checkpoint loading is not available in this build ({}); omit --model-path to \
             use the goal-seek policy",
            path.display()
        );
    }
    if cli.sensor_pub_rate <= 0.0 || cli.control_period <= 0.0 {
        bail!("sensor_pub_rate and control_period must be positive");
    }

    let bus = BusClient::connect(&cli.bus)
        .await
        .with_context(|| format!("connecting to bus at {}", cli.bus))?;
    let policy = Box::new(GoalSeekPolicy::new(cli.stop_distance));
    let config = AgentConfig {
        modality: cli.input_type,
        continuous: cli.continuous,
        sensor_pub_rate: cli.sensor_pub_rate,
        control_period: cli.control_period,
        queue_size: cli.queue_size,
    };
    let node = AgentNode::new(bus, policy, config)?;

    info!(event = "agent.ready", bus = %cli.bus, input_type = %cli.input_type);
    node.run().await?;
    info!(event = "agent.stopped");
    Ok(())
}
