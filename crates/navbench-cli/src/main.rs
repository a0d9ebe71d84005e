//! navbench - evaluate a navigation policy over a simulated episode dataset.
//!
//! Binds the message bus, optionally spawns the environment and agent node
//! binaries, runs every configured seed over the dataset, and writes
//! per-episode, per-seed and session summary logs.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};

use navbench_cli::{load_seeds_from_file, run_session, SessionOptions};
use navbench_core::codec::InputModality;
use navbench_core::msg::NO_MORE_EPISODES;
use navbench_core::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "navbench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed evaluation of pointgoal navigation policies", long_about = None)]
struct Cli {
    /// Sensor suite: blind, rgb, depth or rgbd
    #[arg(long, default_value = "rgbd")]
    input_type: InputModality,

    /// Policy checkpoint forwarded to the agent node
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Task configuration file (TOML)
    #[arg(long)]
    task_config: PathBuf,

    /// Resume: last-completed episode id ("-1" starts fresh)
    #[arg(long, default_value = NO_MORE_EPISODES)]
    episode_id: String,

    /// Resume: scene of the last-completed episode
    #[arg(long, default_value = "")]
    scene_id: String,

    /// CSV file with one seed per row; a single default seed when omitted
    #[arg(long)]
    seed_file_path: Option<PathBuf>,

    /// Seed used when no seed file is given
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Override the configured sensor publication rate (Hz)
    #[arg(long)]
    sensor_pub_rate: Option<f64>,

    /// Directory for result logs
    #[arg(long, default_value = "logs/")]
    log_dir: PathBuf,

    /// Bus bind address (port 0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:0")]
    bus_addr: String,

    /// Do not spawn node binaries; expect them to connect to --bus-addr
    #[arg(long)]
    do_not_start_nodes: bool,

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

    let seeds = match &cli.seed_file_path {
        Some(path) => load_seeds_from_file(path)
            .with_context(|| format!("loading seeds from {}", path.display()))?,
        None => vec![cli.seed],
    };

    let options = SessionOptions {
        task_config_path: cli.task_config,
        input_type: cli.input_type,
        model_path: cli.model_path,
        seeds,
        resume_episode_id: cli.episode_id,
        resume_scene_id: cli.scene_id,
        log_dir: cli.log_dir.clone(),
        bus_addr: cli.bus_addr,
        sensor_pub_rate: cli.sensor_pub_rate,
        spawn_nodes: !cli.do_not_start_nodes,
    };

    let summary = run_session(options).await?;

    match &summary.overall {
        Some(overall) => info!(
            event = "session.summary",
            seeds = summary.per_seed.len(),
            episodes = summary.total_episodes(),
            distance_to_goal = overall.distance_to_goal,
            success = overall.success,
            spl = overall.spl,
            log_dir = %cli.log_dir.display(),
        ),
        None => info!(event = "session.summary", episodes = 0usize),
    }
    Ok(())
}
