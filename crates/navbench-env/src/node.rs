//! Environment node: owns the simulator and runs episodes on demand.
//!
//! The node answers the blocking `env/eval_episode` call. One call runs one
//! full episode: load it, announce it on the `episode` channel, then drive
//! the mode-specific step loop until the agent stops, a budget runs out, or
//! the episode aborts. Stamps are monotonic across episodes within one node
//! process, so the agent-side join can never confuse two episodes.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use navbench_core::bus::{BusClient, BusMessage};
use navbench_core::codec::{
    self, msg_to_action, pointgoal_to_msg, AgentAction, InputModality,
};
use navbench_core::config::{EpisodeSpec, SimMode, TaskConfig};
use navbench_core::error::{EvalError, Result};
use navbench_core::metrics::EpisodeMetrics;
use navbench_core::msg::{
    services, topics, ActionMsg, EpisodeNotice, EvalEpisodeRequest, EvalEpisodeResponse, TwistMsg,
    NO_MORE_EPISODES,
};
use navbench_core::obs;
use navbench_core::ServiceRequest;

use crate::dataset::EpisodeIterator;
use crate::sim::Simulator;

pub struct EnvNode {
    bus: BusClient,
    sim: Box<dyn Simulator>,
    config: TaskConfig,
    modality: InputModality,
    episodes: EpisodeIterator,
    commands: mpsc::UnboundedReceiver<BusMessage>,
    requests: mpsc::UnboundedReceiver<ServiceRequest>,
    stamp: u64,
}

impl EnvNode {
    /// Wire the node to the bus. Topic subscriptions go out before the
    /// service registrations; the broker handles one connection's frames in
    /// order, so a successful probe of `env/eval_episode` implies the
    /// command subscription is already active.
    pub fn new(
        bus: BusClient,
        sim: Box<dyn Simulator>,
        config: TaskConfig,
        modality: InputModality,
    ) -> Result<Self> {
        let command_topic = match config.mode {
            SimMode::Discrete => topics::ACTION,
            SimMode::Continuous => topics::CMD_VEL,
        };
        let commands = bus.subscribe(command_topic)?;
        bus.register(services::EVAL_EPISODE)?;
        bus.register(services::ENV_SHUTDOWN)?;
        let requests = bus
            .take_requests()
            .ok_or_else(|| EvalError::Config("bus request stream already taken".into()))?;
        let episodes = EpisodeIterator::new(config.episodes.clone());
        Ok(Self {
            bus,
            sim,
            config,
            modality,
            episodes,
            commands,
            requests,
            stamp: 0,
        })
    }

    /// Serve episode-control calls until shutdown is requested or the bus
    /// connection drops.
    pub async fn run(mut self) -> Result<()> {
        while let Some(req) = self.requests.recv().await {
            match req.service.as_str() {
                services::EVAL_EPISODE => {
                    let request: EvalEpisodeRequest = serde_json::from_value(req.payload)?;
                    let response = self.handle_eval(&request).await?;
                    self.bus.respond(req.id, serde_json::to_value(&response)?)?;
                }
                services::ENV_SHUTDOWN => {
                    self.bus.respond(req.id, Value::Null)?;
                    break;
                }
                other => {
                    warn!(service = %other, "unexpected service request");
                    self.bus.respond(req.id, Value::Null)?;
                }
            }
        }
        Ok(())
    }

    async fn handle_eval(&mut self, request: &EvalEpisodeRequest) -> Result<EvalEpisodeResponse> {
        if request.episode_id_last != NO_MORE_EPISODES
            && !self
                .episodes
                .seek_past(&request.episode_id_last, &request.scene_id_last)
        {
            warn!(
                episode_id = %request.episode_id_last,
                scene_id = %request.scene_id_last,
                "resume hint not in dataset, continuing from current position"
            );
        }

        let Some(episode) = self.episodes.next_episode() else {
            return Ok(EvalEpisodeResponse::sentinel());
        };

        self.sim.load_episode(&episode);
        obs::emit_episode_started(&episode.episode_id, &episode.scene_id);

        // commands left over from the previous episode must not leak in
        while self.commands.try_recv().is_ok() {}

        let notice = EpisodeNotice {
            episode_id: episode.episode_id.clone(),
            scene_id: episode.scene_id.clone(),
        };
        let stamp = self.next_stamp();
        self.bus
            .publish(topics::EPISODE, BusMessage::new(stamp, &notice)?)?;

        let metrics = match self.config.mode {
            SimMode::Discrete => self.run_discrete(&episode).await?,
            SimMode::Continuous => self.run_continuous(&episode).await?,
        };
        obs::emit_episode_finished(&episode.episode_id, &episode.scene_id, &metrics);

        Ok(EvalEpisodeResponse {
            episode_id: episode.episode_id,
            scene_id: episode.scene_id,
            distance_to_goal: metrics.distance_to_goal,
            success: metrics.success,
            spl: metrics.spl,
        })
    }

    /// Turn-based loop: publish one stamped observation set, wait for the
    /// matching action, step. A missing or malformed action aborts the
    /// episode with failure metrics.
    async fn run_discrete(&mut self, episode: &EpisodeSpec) -> Result<EpisodeMetrics> {
        let timeout = Duration::from_secs_f64(self.config.action_timeout_s);
        let mut path_length = 0.0;
        let mut stopped = false;

        for _ in 0..self.config.max_episode_steps {
            let stamp = self.next_stamp();
            self.publish_observations(stamp)?;

            let action = match self.await_action(stamp, timeout).await {
                Ok(action) => action,
                Err(reason) => {
                    obs::emit_episode_aborted(&episode.episode_id, &episode.scene_id, &reason);
                    return Ok(EpisodeMetrics::failure(self.sim.distance_to_goal()));
                }
            };

            if action == AgentAction::Stop {
                stopped = true;
                break;
            }
            let before = self.sim.position();
            self.sim.apply_action(action);
            path_length += planar_distance(before, self.sim.position());
            if self.sim.is_done() {
                break;
            }
        }

        Ok(self.terminal_metrics(stopped, path_length))
    }

    /// Clocked loop: observations go out and the simulator integrates by
    /// one sensor period every tick, under the newest velocity command.
    /// The command channel is polled once per control period, so a command
    /// stays in effect for a full period. An all-zero twist is the stop
    /// signal; no command yet means stand still. The wall-clock budget
    /// bounds runaway agents.
    async fn run_continuous(&mut self, episode: &EpisodeSpec) -> Result<EpisodeMetrics> {
        let sensor_period = Duration::from_secs_f64(1.0 / self.config.sensor_pub_rate);
        let dt = sensor_period.as_secs_f64();
        let ticks_per_control =
            ((self.config.sensor_pub_rate * self.config.control_period).round() as u64).max(1);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs_f64(self.config.max_duration_s);

        let mut ticker = tokio::time::interval(sensor_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut path_length = 0.0;
        let mut stopped = false;
        let mut latest: Option<TwistMsg> = None;
        let mut ticks: u64 = 0;

        loop {
            if tokio::time::Instant::now() >= deadline {
                obs::emit_episode_aborted(
                    &episode.episode_id,
                    &episode.scene_id,
                    "wall-clock budget exhausted",
                );
                break;
            }
            ticker.tick().await;

            if ticks % ticks_per_control == 0 {
                // newest command wins
                loop {
                    match self.commands.try_recv() {
                        Ok(msg) => match msg.decode::<TwistMsg>() {
                            Ok(twist) => latest = Some(twist),
                            Err(err) => {
                                obs::emit_episode_aborted(
                                    &episode.episode_id,
                                    &episode.scene_id,
                                    &err.to_string(),
                                );
                                return Ok(EpisodeMetrics::failure(self.sim.distance_to_goal()));
                            }
                        },
                        Err(_) => break,
                    }
                }
                if latest.is_some_and(|twist| twist.is_zero()) {
                    stopped = true;
                    break;
                }
            }
            ticks += 1;

            let stamp = self.next_stamp();
            self.publish_observations(stamp)?;

            if let Some(twist) = latest {
                let before = self.sim.position();
                self.sim.integrate(&twist, dt);
                path_length += planar_distance(before, self.sim.position());
            }
            if self.sim.is_done() {
                break;
            }
        }

        Ok(self.terminal_metrics(stopped, path_length))
    }

    /// Wait for the action answering the observation at `stamp`. Actions
    /// stamped earlier are leftovers of dropped ticks and are discarded.
    async fn await_action(
        &mut self,
        stamp: u64,
        timeout: Duration,
    ) -> std::result::Result<AgentAction, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.commands.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err("action channel closed".to_string()),
                Err(_) => {
                    return Err(format!(
                        "no action within {:.1}s of publishing observations",
                        timeout.as_secs_f64()
                    ))
                }
            };
            if msg.stamp != stamp {
                warn!(got = msg.stamp, expected = stamp, "action for wrong stamp dropped");
                continue;
            }
            let action_msg: ActionMsg = msg.decode().map_err(|err| err.to_string())?;
            return msg_to_action(&action_msg).map_err(|err| err.to_string());
        }
    }

    fn publish_observations(&mut self, stamp: u64) -> Result<()> {
        let observed = self.sim.observations();
        if self.modality.wants_rgb() {
            let rgb = observed
                .rgb
                .as_ref()
                .ok_or_else(|| EvalError::Config("simulator produced no rgb channel".into()))?;
            self.bus
                .publish(topics::RGB, BusMessage::new(stamp, &codec::rgb_to_msg(rgb))?)?;
        }
        if self.modality.wants_depth() {
            let depth = observed
                .depth
                .as_ref()
                .ok_or_else(|| EvalError::Config("simulator produced no depth channel".into()))?;
            self.bus.publish(
                topics::DEPTH,
                BusMessage::new(stamp, &codec::depth_to_msg(depth))?,
            )?;
        }
        let pointgoal = observed
            .pointgoal
            .ok_or_else(|| EvalError::Config("simulator produced no pointgoal channel".into()))?;
        self.bus.publish(
            topics::POINTGOAL,
            BusMessage::new(stamp, &pointgoal_to_msg(pointgoal))?,
        )?;
        Ok(())
    }

    fn terminal_metrics(&self, stopped: bool, path_length: f64) -> EpisodeMetrics {
        let distance_to_goal = self.sim.distance_to_goal();
        let success = if stopped && distance_to_goal <= self.config.success_distance {
            1.0
        } else {
            0.0
        };
        let geodesic = self.sim.geodesic_distance();
        let spl = if success > 0.0 {
            if geodesic > 0.0 {
                geodesic / geodesic.max(path_length)
            } else {
                1.0
            }
        } else {
            0.0
        };
        EpisodeMetrics {
            distance_to_goal,
            success,
            spl,
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }
}

fn planar_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (b.0 - a.0).hypot(b.1 - a.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::PlanarSim;
    use navbench_core::bus::Broker;
    use navbench_core::codec::action_to_msg;

    fn config(mode: SimMode, goal: [f64; 2]) -> TaskConfig {
        TaskConfig {
            mode,
            max_episode_steps: 10,
            success_distance: 0.2,
            sensor_pub_rate: 20.0,
            control_period: 0.1,
            action_timeout_s: 1.0,
            max_duration_s: 5.0,
            resolution: 4,
            episodes: vec![EpisodeSpec {
                episode_id: "0".to_string(),
                scene_id: "scenes/unit.glb".to_string(),
                start: [0.0, 0.0, 0.0],
                goal,
            }],
        }
    }

    async fn start_broker() -> String {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());
        addr
    }

    async fn spawn_env(addr: &str, cfg: TaskConfig) {
        let bus = BusClient::connect(addr).await.unwrap();
        let sim = Box::new(PlanarSim::new(cfg.resolution));
        let node = EnvNode::new(bus, sim, cfg, InputModality::Blind).unwrap();
        tokio::spawn(node.run());
    }

    #[tokio::test]
    async fn test_discrete_episode_immediate_stop_succeeds() {
        let addr = start_broker().await;

        // scripted agent: stop at the first observation
        let agent = BusClient::connect(&addr).await.unwrap();
        let mut pointgoal = agent.subscribe(topics::POINTGOAL).unwrap();
        // fence so the subscription is active before the node publishes
        agent.probe("nothing").await.unwrap_err();
        let agent_pub = agent.clone();
        tokio::spawn(async move {
            while let Some(msg) = pointgoal.recv().await {
                let action = BusMessage::new(msg.stamp, &action_to_msg(AgentAction::Stop)).unwrap();
                agent_pub.publish(topics::ACTION, action).unwrap();
            }
        });

        spawn_env(&addr, config(SimMode::Discrete, [0.1, 0.0])).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::EVAL_EPISODE, 50, Duration::from_millis(20))
            .await
            .unwrap();
        let raw = eval
            .call(
                services::EVAL_EPISODE,
                serde_json::to_value(EvalEpisodeRequest::next()).unwrap(),
            )
            .await
            .unwrap();
        let resp: EvalEpisodeResponse = serde_json::from_value(raw).unwrap();

        assert_eq!(resp.episode_id, "0");
        assert_eq!(resp.success, 1.0);
        // stopped on the spot: optimal path
        assert!((resp.spl - 1.0).abs() < 1e-9);
        assert!((resp.distance_to_goal - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sentinel_after_dataset_exhausted_then_rewind() {
        let addr = start_broker().await;

        let agent = BusClient::connect(&addr).await.unwrap();
        let mut pointgoal = agent.subscribe(topics::POINTGOAL).unwrap();
        agent.probe("nothing").await.unwrap_err();
        let agent_pub = agent.clone();
        tokio::spawn(async move {
            while let Some(msg) = pointgoal.recv().await {
                let action = BusMessage::new(msg.stamp, &action_to_msg(AgentAction::Stop)).unwrap();
                agent_pub.publish(topics::ACTION, action).unwrap();
            }
        });

        spawn_env(&addr, config(SimMode::Discrete, [0.1, 0.0])).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::EVAL_EPISODE, 50, Duration::from_millis(20))
            .await
            .unwrap();

        let next = serde_json::to_value(EvalEpisodeRequest::next()).unwrap();
        let first: EvalEpisodeResponse =
            serde_json::from_value(eval.call(services::EVAL_EPISODE, next.clone()).await.unwrap())
                .unwrap();
        assert_eq!(first.episode_id, "0");

        let second: EvalEpisodeResponse =
            serde_json::from_value(eval.call(services::EVAL_EPISODE, next.clone()).await.unwrap())
                .unwrap();
        assert!(second.is_sentinel());

        // the iterator rewinds, a fresh seed run sees the dataset again
        let third: EvalEpisodeResponse =
            serde_json::from_value(eval.call(services::EVAL_EPISODE, next).await.unwrap()).unwrap();
        assert_eq!(third.episode_id, "0");
    }

    #[tokio::test]
    async fn test_mute_agent_times_out_with_failure_metrics() {
        let addr = start_broker().await;
        let mut cfg = config(SimMode::Discrete, [3.0, 0.0]);
        cfg.action_timeout_s = 0.2;
        spawn_env(&addr, cfg).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::EVAL_EPISODE, 50, Duration::from_millis(20))
            .await
            .unwrap();
        let resp: EvalEpisodeResponse = serde_json::from_value(
            eval.call(
                services::EVAL_EPISODE,
                serde_json::to_value(EvalEpisodeRequest::next()).unwrap(),
            )
            .await
            .unwrap(),
        )
        .unwrap();

        assert_eq!(resp.success, 0.0);
        assert_eq!(resp.spl, 0.0);
        assert!((resp.distance_to_goal - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_continuous_zero_twist_stops_episode() {
        let addr = start_broker().await;

        let agent = BusClient::connect(&addr).await.unwrap();
        let mut pointgoal = agent.subscribe(topics::POINTGOAL).unwrap();
        agent.probe("nothing").await.unwrap_err();
        let agent_pub = agent.clone();
        tokio::spawn(async move {
            while let Some(msg) = pointgoal.recv().await {
                let twist = BusMessage::new(msg.stamp, &TwistMsg::zero()).unwrap();
                agent_pub.publish(topics::CMD_VEL, twist).unwrap();
            }
        });

        spawn_env(&addr, config(SimMode::Continuous, [0.1, 0.0])).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::EVAL_EPISODE, 50, Duration::from_millis(20))
            .await
            .unwrap();
        let resp: EvalEpisodeResponse = serde_json::from_value(
            eval.call(
                services::EVAL_EPISODE,
                serde_json::to_value(EvalEpisodeRequest::next()).unwrap(),
            )
            .await
            .unwrap(),
        )
        .unwrap();

        assert_eq!(resp.success, 1.0);
        assert!((resp.distance_to_goal - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_service_ends_run_loop() {
        let addr = start_broker().await;
        spawn_env(&addr, config(SimMode::Discrete, [0.1, 0.0])).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::ENV_SHUTDOWN, 50, Duration::from_millis(20))
            .await
            .unwrap();
        eval.call(services::ENV_SHUTDOWN, Value::Null).await.unwrap();

        // after shutdown the provider is gone
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(eval.probe(services::EVAL_EPISODE).await.is_err());
    }
}
