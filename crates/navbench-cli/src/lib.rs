//! Evaluator library: the per-seed episode loop, metric aggregation, log
//! emission, and node process lifecycle.
//!
//! The session owns the broker. Nodes either get spawned as sibling
//! binaries (with `kill_on_drop` as the backstop should the evaluator die
//! before the graceful shutdown calls) or are started externally against a
//! fixed bus address.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use navbench_core::bus::{Broker, BusClient};
use navbench_core::codec::InputModality;
use navbench_core::config::TaskConfig;
use navbench_core::error::{EvalError, Result};
use navbench_core::logsink::{
    self, episode_log_path, seed_episode_dir, seed_log_path, summary_log_path,
};
use navbench_core::metrics::{average_metrics, EpisodeHandle, EpisodeMetrics};
use navbench_core::msg::{
    services, EvalEpisodeRequest, EvalEpisodeResponse, ResetRequest, NO_MORE_EPISODES,
};
use navbench_core::obs;
use navbench_core::SimMode;

/// How long to poll for node services before giving up on startup.
const SERVICE_WAIT_ATTEMPTS: u32 = 150;
const SERVICE_WAIT_DELAY: Duration = Duration::from_millis(100);

/// Grace period for spawned nodes to exit after their shutdown call.
const NODE_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives episodes through the blocking `env/eval_episode` call.
pub struct Evaluator {
    bus: BusClient,
}

impl Evaluator {
    pub fn new(bus: BusClient) -> Self {
        Self { bus }
    }

    /// Run episodes until the sentinel or a transport failure. The resume
    /// hints name the last-completed episode of an interrupted run;
    /// `("-1", "")` starts from the top. A transport failure is non-fatal:
    /// what was collected so far is returned.
    pub async fn evaluate(
        &self,
        resume_episode_id: &str,
        resume_scene_id: &str,
        seed: u64,
        log_dir: &Path,
    ) -> Result<Vec<(EpisodeHandle, EpisodeMetrics)>> {
        let mut collected = Vec::new();
        let mut request = EvalEpisodeRequest {
            episode_id_last: resume_episode_id.to_string(),
            scene_id_last: resume_scene_id.to_string(),
        };

        loop {
            let raw = match self
                .bus
                .call(services::EVAL_EPISODE, serde_json::to_value(&request)?)
                .await
            {
                Ok(raw) => raw,
                Err(err) => {
                    obs::emit_session_stopped(&err.to_string(), collected.len());
                    break;
                }
            };
            let response: EvalEpisodeResponse = serde_json::from_value(raw)?;
            if response.is_sentinel() {
                break;
            }

            let handle = EpisodeHandle {
                episode_id: response.episode_id.clone(),
                scene_id: response.scene_id.clone(),
            };
            let metrics = EpisodeMetrics {
                distance_to_goal: response.distance_to_goal,
                success: response.success,
                spl: response.spl,
            };
            info!(
                event = "eval.episode",
                seed = seed,
                episode_id = %handle.episode_id,
                scene_id = %handle.scene_id,
                success = metrics.success,
                spl = metrics.spl,
            );
            write_episode_log(log_dir, &handle, &metrics)?;
            collected.push((handle, metrics));
            request = EvalEpisodeRequest::next();
        }

        Ok(collected)
    }

    /// Top-down map generation needs simulator internals the bridged
    /// setting does not expose.
    pub fn generate_map(&self) -> Result<()> {
        Err(EvalError::NotSupported("top-down map generation"))
    }

    /// Video generation needs simulator internals the bridged setting does
    /// not expose.
    pub fn generate_video(&self) -> Result<()> {
        Err(EvalError::NotSupported("video generation"))
    }
}

fn write_episode_log(
    log_dir: &Path,
    handle: &EpisodeHandle,
    metrics: &EpisodeMetrics,
) -> Result<()> {
    let path = episode_log_path(log_dir, &handle.episode_id, &handle.scene_id);
    let mut log = logsink::MetricsLog::create(&path)?;
    log.line(&format!("episode_id,{}", handle.episode_id))?;
    log.line(&format!("scene_id,{}", handle.scene_id))?;
    for (key, value) in metrics.as_pairs() {
        log.metric(key, value)?;
    }
    log.flush()?;
    Ok(())
}

/// All episodes of one seed run, in completion order.
#[derive(Debug)]
pub struct SeedRunRecord {
    pub seed: u64,
    pub episodes: Vec<(EpisodeHandle, EpisodeMetrics)>,
}

impl SeedRunRecord {
    pub fn average(&self) -> Option<EpisodeMetrics> {
        average_metrics(self.episodes.iter().map(|(_, m)| m))
    }
}

#[derive(Debug)]
pub struct SessionSummary {
    pub per_seed: Vec<SeedRunRecord>,
    /// Average of the per-seed averages; `None` when nothing completed.
    pub overall: Option<EpisodeMetrics>,
}

impl SessionSummary {
    pub fn total_episodes(&self) -> usize {
        self.per_seed.iter().map(|r| r.episodes.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub task_config_path: PathBuf,
    pub input_type: InputModality,
    pub model_path: Option<PathBuf>,
    pub seeds: Vec<u64>,
    /// Resume hints for the first seed run; `("-1", "")` starts fresh.
    pub resume_episode_id: String,
    pub resume_scene_id: String,
    pub log_dir: PathBuf,
    pub bus_addr: String,
    pub sensor_pub_rate: Option<f64>,
    /// When false, the env and agent nodes are expected to connect to
    /// `bus_addr` on their own.
    pub spawn_nodes: bool,
}

/// Run a full evaluation session: bind the broker, bring the nodes up,
/// loop over seeds, aggregate, shut down.
pub async fn run_session(options: SessionOptions) -> Result<SessionSummary> {
    let mut config = TaskConfig::from_file(&options.task_config_path)?;
    if let Some(rate) = options.sensor_pub_rate {
        config.sensor_pub_rate = rate;
        config.validate()?;
    }
    if options.seeds.is_empty() {
        return Err(EvalError::Config("no seeds to evaluate".into()));
    }
    std::fs::create_dir_all(&options.log_dir)?;

    let broker = Broker::bind(&options.bus_addr).await?;
    let addr = broker.local_addr()?.to_string();
    tokio::spawn(broker.run());
    info!(event = "session.bus", addr = %addr);

    let nodes = if options.spawn_nodes {
        Some(NodeProcs::spawn(&addr, &config, &options)?)
    } else {
        None
    };

    let bus = BusClient::connect(&addr).await?;
    let summary = run_seed_loop(
        &bus,
        &options.seeds,
        &options.resume_episode_id,
        &options.resume_scene_id,
        &options.log_dir,
    )
    .await?;

    if nodes.is_some() {
        // graceful shutdown first; kill_on_drop reaps anything that ignores it
        if let Err(err) = bus.call(services::AGENT_SHUTDOWN, Value::Null).await {
            warn!(error = %err, "agent shutdown call failed");
        }
        if let Err(err) = bus.call(services::ENV_SHUTDOWN, Value::Null).await {
            warn!(error = %err, "env shutdown call failed");
        }
    }
    if let Some(nodes) = nodes {
        nodes.reap().await;
    }

    Ok(summary)
}

/// The seed loop against an already-running bus and nodes: wait for the
/// node services, then per seed reseed the agent, evaluate, and write the
/// seed and session summary logs.
pub async fn run_seed_loop(
    bus: &BusClient,
    seeds: &[u64],
    resume_episode_id: &str,
    resume_scene_id: &str,
    log_dir: &Path,
) -> Result<SessionSummary> {
    bus.wait_for_service(services::EVAL_EPISODE, SERVICE_WAIT_ATTEMPTS, SERVICE_WAIT_DELAY)
        .await?;
    bus.wait_for_service(services::AGENT_RESET, SERVICE_WAIT_ATTEMPTS, SERVICE_WAIT_DELAY)
        .await?;

    let evaluator = Evaluator::new(bus.clone());
    let mut per_seed: Vec<SeedRunRecord> = Vec::new();

    for (index, &seed) in seeds.iter().enumerate() {
        let reset = serde_json::to_value(ResetRequest { seed })?;
        if let Err(err) = bus.call(services::AGENT_RESET, reset).await {
            obs::emit_session_stopped(
                &err.to_string(),
                per_seed.iter().map(|r| r.episodes.len()).sum(),
            );
            break;
        }

        // resume hints apply to the first seed only
        let (ep_hint, scene_hint) = if index == 0 {
            (resume_episode_id, resume_scene_id)
        } else {
            (NO_MORE_EPISODES, "")
        };

        let episode_dir = seed_episode_dir(log_dir, seed);
        let episodes = evaluator
            .evaluate(ep_hint, scene_hint, seed, &episode_dir)
            .await?;
        let record = SeedRunRecord { seed, episodes };
        write_seed_log(log_dir, &record)?;
        obs::emit_seed_finished(seed, record.episodes.len());
        per_seed.push(record);
    }

    let seed_averages: Vec<EpisodeMetrics> =
        per_seed.iter().filter_map(|r| r.average()).collect();
    let overall = average_metrics(seed_averages.iter());
    let summary = SessionSummary { per_seed, overall };
    write_summary_log(log_dir, &summary)?;
    obs::emit_session_finished(summary.per_seed.len(), summary.total_episodes());
    Ok(summary)
}

fn write_seed_log(log_dir: &Path, record: &SeedRunRecord) -> Result<()> {
    let mut log = logsink::MetricsLog::create(seed_log_path(log_dir, record.seed))?;
    log.line(&format!("seed,{}", record.seed))?;
    log.line(&format!("episodes,{}", record.episodes.len()))?;
    if let Some(avg) = record.average() {
        for (key, value) in avg.as_pairs() {
            log.metric(key, value)?;
        }
    }
    log.flush()?;
    Ok(())
}

fn write_summary_log(log_dir: &Path, summary: &SessionSummary) -> Result<()> {
    let mut log = logsink::MetricsLog::create(summary_log_path(log_dir))?;
    log.line(&format!("seeds,{}", summary.per_seed.len()))?;
    log.line(&format!("episodes,{}", summary.total_episodes()))?;
    if let Some(overall) = &summary.overall {
        for (key, value) in overall.as_pairs() {
            log.metric(key, value)?;
        }
    }
    log.flush()?;
    Ok(())
}

/// One seed per CSV row (first field); blank rows are skipped.
pub fn load_seeds_from_file(path: &Path) -> Result<Vec<u64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|err| EvalError::Config(format!("cannot read seed file {}: {err}", path.display())))?;

    let mut seeds = Vec::new();
    for row in reader.records() {
        let row =
            row.map_err(|err| EvalError::Config(format!("malformed seed file: {err}")))?;
        let Some(field) = row.get(0) else { continue };
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let seed = field
            .parse::<u64>()
            .map_err(|err| EvalError::Config(format!("bad seed {field:?}: {err}")))?;
        seeds.push(seed);
    }
    Ok(seeds)
}

/// The spawned env and agent node processes.
struct NodeProcs {
    env: Child,
    agent: Child,
}

impl NodeProcs {
    fn spawn(bus_addr: &str, config: &TaskConfig, options: &SessionOptions) -> Result<Self> {
        let exe_dir = std::env::current_exe()?
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| EvalError::Config("cannot locate sibling node binaries".into()))?;
        let continuous = config.mode == SimMode::Continuous;

        let mut env_cmd = Command::new(exe_dir.join("navbench-env"));
        env_cmd
            .arg("--bus")
            .arg(bus_addr)
            .arg("--task-config")
            .arg(&options.task_config_path)
            .arg("--input-type")
            .arg(options.input_type.to_string());
        if let Some(rate) = options.sensor_pub_rate {
            env_cmd.arg("--sensor-pub-rate").arg(rate.to_string());
        }
        if continuous {
            env_cmd.arg("--enable-physics");
        }
        env_cmd.kill_on_drop(true);
        let env = env_cmd.spawn()?;

        let mut agent_cmd = Command::new(exe_dir.join("navbench-agent"));
        agent_cmd
            .arg("--bus")
            .arg(bus_addr)
            .arg("--input-type")
            .arg(options.input_type.to_string())
            .arg("--sensor-pub-rate")
            .arg(config.sensor_pub_rate.to_string())
            .arg("--control-period")
            .arg(config.control_period.to_string())
            .arg("--stop-distance")
            .arg(config.success_distance.to_string());
        if continuous {
            agent_cmd.arg("--continuous");
        }
        if let Some(model) = &options.model_path {
            agent_cmd.arg("--model-path").arg(model);
        }
        agent_cmd.kill_on_drop(true);
        let agent = agent_cmd.spawn()?;

        Ok(Self { env, agent })
    }

    /// Wait for both nodes to exit after the shutdown calls, killing any
    /// that outlive the grace period.
    async fn reap(mut self) {
        for (name, child) in [("agent", &mut self.agent), ("env", &mut self.env)] {
            match tokio::time::timeout(NODE_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => info!(event = "node.exited", node = name, status = %status),
                Ok(Err(err)) => warn!(node = name, error = %err, "waiting for node failed"),
                Err(_) => {
                    warn!(node = name, "node ignored shutdown, killing");
                    let _ = child.start_kill();
                }
            }
        }
    }
}
