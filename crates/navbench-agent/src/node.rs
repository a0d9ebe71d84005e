//! Agent node: joins stamped sensor messages, runs the policy, answers with
//! actions.
//!
//! All subscribed channels flow through one tagged receiver so the episode
//! start notice cannot be reordered against sensor messages: everything
//! published before the notice is cleared, everything after it belongs to
//! the new episode.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use navbench_core::bus::{BusClient, BusMessage};
use navbench_core::codec::{
    action_to_msg, action_to_twist, decode_observations, InputModality,
};
use navbench_core::error::{EvalError, Result};
use navbench_core::msg::{
    services, topics, DepthMsg, EpisodeNotice, PointGoalMsg, ResetRequest, RgbMsg,
};
use navbench_core::{ServiceRequest, SyncedBundle, TimeSynchronizer};

use crate::policy::Policy;

/// Actuation gate for continuous mode: publish once every
/// `sensor_pub_rate * control_period - 1` join firings (floor, at least 1),
/// so commands arrive at roughly the control period rather than the sensor
/// rate.
pub fn actuation_gate(sensor_pub_rate: f64, control_period: f64) -> u64 {
    (((sensor_pub_rate * control_period) as i64) - 1).max(1) as u64
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub modality: InputModality,
    pub continuous: bool,
    pub sensor_pub_rate: f64,
    pub control_period: f64,
    pub queue_size: usize,
}

pub struct AgentNode {
    bus: BusClient,
    policy: Box<dyn Policy>,
    config: AgentConfig,
    sync: TimeSynchronizer,
    feed: mpsc::UnboundedReceiver<(String, BusMessage)>,
    requests: mpsc::UnboundedReceiver<ServiceRequest>,
    frame_count: u64,
    gate: u64,
}

impl AgentNode {
    /// Wire the node to the bus. Subscriptions go out before the service
    /// registrations, so once `agent/reset` answers a probe the sensor
    /// channels are already flowing.
    pub fn new(bus: BusClient, policy: Box<dyn Policy>, config: AgentConfig) -> Result<Self> {
        let mut channels: Vec<&str> = config.modality.topics().to_vec();
        channels.push(topics::EPISODE);
        let feed = bus.subscribe_many(&channels)?;
        bus.register(services::AGENT_RESET)?;
        bus.register(services::AGENT_SHUTDOWN)?;
        let requests = bus
            .take_requests()
            .ok_or_else(|| EvalError::Config("bus request stream already taken".into()))?;

        let sync = TimeSynchronizer::new(
            config.modality.topics().iter().copied(),
            config.queue_size,
        );
        let gate = actuation_gate(config.sensor_pub_rate, config.control_period);
        Ok(Self {
            bus,
            policy,
            config,
            sync,
            feed,
            requests,
            frame_count: 0,
            gate,
        })
    }

    /// Serve sensor callbacks and service requests until shutdown is
    /// requested or the bus connection drops.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                incoming = self.feed.recv() => {
                    let Some((topic, message)) = incoming else { break };
                    if topic == topics::EPISODE {
                        self.on_episode_notice(&message);
                    } else if let Some(bundle) = self.sync.insert(&topic, message) {
                        if let Err(err) = self.act_on_bundle(&bundle) {
                            // the env node converts the missing action into
                            // failure metrics for this episode
                            error!(
                                stamp = bundle.stamp,
                                error = %err,
                                "dropping tick on malformed observation bundle"
                            );
                        }
                    }
                }
                incoming = self.requests.recv() => {
                    let Some(request) = incoming else { break };
                    if self.handle_request(request)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns true when the node should shut down.
    fn handle_request(&mut self, request: ServiceRequest) -> Result<bool> {
        match request.service.as_str() {
            services::AGENT_RESET => {
                match serde_json::from_value::<ResetRequest>(request.payload) {
                    Ok(reset) => {
                        info!(event = "agent.reset", seed = reset.seed);
                        self.policy.reset(reset.seed);
                        self.sync.clear();
                        self.frame_count = 0;
                    }
                    Err(err) => warn!(error = %err, "malformed reset request ignored"),
                }
                self.bus.respond(request.id, Value::Null)?;
                Ok(false)
            }
            services::AGENT_SHUTDOWN => {
                self.bus.respond(request.id, Value::Null)?;
                Ok(true)
            }
            other => {
                warn!(service = %other, "unexpected service request");
                self.bus.respond(request.id, Value::Null)?;
                Ok(false)
            }
        }
    }

    fn on_episode_notice(&mut self, message: &BusMessage) {
        match message.decode::<EpisodeNotice>() {
            Ok(notice) => {
                info!(
                    event = "agent.episode",
                    episode_id = %notice.episode_id,
                    scene_id = %notice.scene_id,
                );
            }
            Err(err) => warn!(error = %err, "unreadable episode notice"),
        }
        // messages of the previous episode must never complete a stamp
        self.sync.clear();
        self.frame_count = 0;
    }

    fn act_on_bundle(&mut self, bundle: &SyncedBundle) -> Result<()> {
        let rgb: Option<RgbMsg> = decode_channel(bundle, topics::RGB)?;
        let depth: Option<DepthMsg> = decode_channel(bundle, topics::DEPTH)?;
        let pointgoal: Option<PointGoalMsg> = decode_channel(bundle, topics::POINTGOAL)?;
        let observations =
            decode_observations(rgb.as_ref(), depth.as_ref(), pointgoal.as_ref())?;

        let action = self.policy.act(&observations);

        if self.config.continuous {
            self.frame_count += 1;
            if self.frame_count < self.gate {
                return Ok(());
            }
            self.frame_count = 0;
            let twist = action_to_twist(action, self.config.control_period);
            self.bus
                .publish(topics::CMD_VEL, BusMessage::new(bundle.stamp, &twist)?)?;
        } else {
            self.bus.publish(
                topics::ACTION,
                BusMessage::new(bundle.stamp, &action_to_msg(action))?,
            )?;
        }
        Ok(())
    }
}

fn decode_channel<T: serde::de::DeserializeOwned>(
    bundle: &SyncedBundle,
    channel: &str,
) -> Result<Option<T>> {
    match bundle.get(channel) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use navbench_core::bus::Broker;
    use navbench_core::codec::AgentAction;
    use navbench_core::msg::{ActionMsg, PointGoalMsg};

    use crate::policy::GoalSeekPolicy;

    async fn start_broker() -> String {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());
        addr
    }

    fn blind_config() -> AgentConfig {
        AgentConfig {
            modality: InputModality::Blind,
            continuous: false,
            sensor_pub_rate: 5.0,
            control_period: 1.0,
            queue_size: 10,
        }
    }

    async fn spawn_agent(addr: &str, config: AgentConfig) {
        let bus = BusClient::connect(addr).await.unwrap();
        let policy = Box::new(GoalSeekPolicy::new(0.2));
        let node = AgentNode::new(bus, policy, config).unwrap();
        tokio::spawn(node.run());
    }

    #[tokio::test]
    async fn test_answers_stamped_observation_with_action() {
        let addr = start_broker().await;

        let env = BusClient::connect(&addr).await.unwrap();
        let mut actions = env.subscribe(topics::ACTION).unwrap();
        env.probe("nothing").await.unwrap_err();

        spawn_agent(&addr, blind_config()).await;
        env.wait_for_service(services::AGENT_RESET, 50, Duration::from_millis(20))
            .await
            .unwrap();

        // far away, straight ahead
        let pg = PointGoalMsg {
            distance_to_goal: 3.0,
            angle_to_goal: 0.0,
        };
        env.publish(topics::POINTGOAL, BusMessage::new(7, &pg).unwrap())
            .unwrap();

        let msg = actions.recv().await.unwrap();
        assert_eq!(msg.stamp, 7);
        let action: ActionMsg = msg.decode().unwrap();
        assert_eq!(action.action, AgentAction::MoveForward.id());
    }

    #[tokio::test]
    async fn test_episode_notice_discards_stale_partial_stamps() {
        let addr = start_broker().await;

        let env = BusClient::connect(&addr).await.unwrap();
        let mut actions = env.subscribe(topics::ACTION).unwrap();
        env.probe("nothing").await.unwrap_err();

        let mut config = blind_config();
        config.modality = InputModality::Rgbd;
        spawn_agent(&addr, config).await;
        env.wait_for_service(services::AGENT_RESET, 50, Duration::from_millis(20))
            .await
            .unwrap();

        let rgb = RgbMsg {
            height: 2,
            width: 2,
            data: vec![0.0; 12],
        };
        let depth = DepthMsg {
            height: 2,
            width: 2,
            data: vec![0.0; 4],
        };
        let pg = PointGoalMsg {
            distance_to_goal: 3.0,
            angle_to_goal: 0.0,
        };

        // stamp 1 is split across the episode boundary and must not fire
        env.publish(topics::RGB, BusMessage::new(1, &rgb).unwrap()).unwrap();
        let notice = EpisodeNotice {
            episode_id: "1".to_string(),
            scene_id: "scenes/a.glb".to_string(),
        };
        env.publish(topics::EPISODE, BusMessage::new(2, &notice).unwrap())
            .unwrap();
        env.publish(topics::DEPTH, BusMessage::new(1, &depth).unwrap()).unwrap();
        env.publish(topics::POINTGOAL, BusMessage::new(1, &pg).unwrap()).unwrap();

        // stamp 3 is complete and fires normally
        env.publish(topics::RGB, BusMessage::new(3, &rgb).unwrap()).unwrap();
        env.publish(topics::DEPTH, BusMessage::new(3, &depth).unwrap()).unwrap();
        env.publish(topics::POINTGOAL, BusMessage::new(3, &pg).unwrap()).unwrap();

        let msg = actions.recv().await.unwrap();
        assert_eq!(msg.stamp, 3);
    }

    #[tokio::test]
    async fn test_continuous_gate_skips_intermediate_firings() {
        let addr = start_broker().await;

        let env = BusClient::connect(&addr).await.unwrap();
        let mut commands = env.subscribe(topics::CMD_VEL).unwrap();
        env.probe("nothing").await.unwrap_err();

        let config = AgentConfig {
            modality: InputModality::Blind,
            continuous: true,
            sensor_pub_rate: 4.0,
            control_period: 1.0,
            queue_size: 10,
        };
        // gate = 4 * 1 - 1 = 3: every third firing publishes
        spawn_agent(&addr, config).await;
        env.wait_for_service(services::AGENT_RESET, 50, Duration::from_millis(20))
            .await
            .unwrap();

        let pg = PointGoalMsg {
            distance_to_goal: 3.0,
            angle_to_goal: 0.0,
        };
        for stamp in 1..=8u64 {
            env.publish(topics::POINTGOAL, BusMessage::new(stamp, &pg).unwrap())
                .unwrap();
        }

        let first = commands.recv().await.unwrap();
        assert_eq!(first.stamp, 3);
        let second = commands.recv().await.unwrap();
        assert_eq!(second.stamp, 6);
    }

    #[tokio::test]
    async fn test_reset_service_answers() {
        let addr = start_broker().await;
        spawn_agent(&addr, blind_config()).await;

        let eval = BusClient::connect(&addr).await.unwrap();
        eval.wait_for_service(services::AGENT_RESET, 50, Duration::from_millis(20))
            .await
            .unwrap();
        eval.call(
            services::AGENT_RESET,
            serde_json::to_value(ResetRequest { seed: 42 }).unwrap(),
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_actuation_gate_arithmetic() {
        assert_eq!(actuation_gate(5.0, 1.0), 4);
        assert_eq!(actuation_gate(20.0, 0.25), 4);
        assert_eq!(actuation_gate(4.0, 1.0), 3);
        // floor, then clamp to at least one firing
        assert_eq!(actuation_gate(1.0, 1.0), 1);
        assert_eq!(actuation_gate(1.0, 0.1), 1);
    }
}
