//! Wire message types for the fixed set of well-known channels.
//!
//! Every sensor/action payload travels inside a [`crate::bus::BusMessage`]
//! envelope, which carries the stamp used by the agent-side join. The types
//! here are the payloads themselves.

use serde::{Deserialize, Serialize};

/// Well-known topic names.
pub mod topics {
    pub const RGB: &str = "rgb";
    pub const DEPTH: &str = "depth";
    pub const POINTGOAL: &str = "pointgoal_with_gps_compass";
    pub const ACTION: &str = "action";
    pub const CMD_VEL: &str = "cmd_vel";
    pub const EPISODE: &str = "episode";
}

/// Well-known service names.
pub mod services {
    pub const EVAL_EPISODE: &str = "env/eval_episode";
    pub const ENV_SHUTDOWN: &str = "env/shutdown";
    pub const AGENT_RESET: &str = "agent/reset";
    pub const AGENT_SHUTDOWN: &str = "agent/shutdown";
}

/// Sentinel episode id meaning "no more episodes".
pub const NO_MORE_EPISODES: &str = "-1";

/// RGB image, H x W x 3 row-major, pixel values as f32.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgbMsg {
    pub height: u32,
    pub width: u32,
    pub data: Vec<f32>,
}

/// Depth image, H x W row-major. The decoder adds the explicit trailing
/// channel dimension of size 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthMsg {
    pub height: u32,
    pub width: u32,
    pub data: Vec<f32>,
}

/// Pointgoal reading relative to the agent: distance and bearing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointGoalMsg {
    pub distance_to_goal: f32,
    pub angle_to_goal: f32,
}

/// Discrete action command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionMsg {
    pub action: i16,
}

/// Six-float velocity command. Only `linear[2]` (z, forward) and
/// `angular[1]` (y, yaw) are used by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwistMsg {
    pub linear: [f64; 3],
    pub angular: [f64; 3],
}

impl TwistMsg {
    pub fn zero() -> Self {
        Self {
            linear: [0.0; 3],
            angular: [0.0; 3],
        }
    }

    /// An all-zero twist is the continuous-mode stop signal.
    pub fn is_zero(&self) -> bool {
        self.linear.iter().all(|v| *v == 0.0) && self.angular.iter().all(|v| *v == 0.0)
    }
}

/// Published on the `episode` channel when the environment node loads a new
/// episode; the agent node resets its episode-scoped counters on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeNotice {
    pub episode_id: String,
    pub scene_id: String,
}

/// Request payload for the `env/eval_episode` service. The hints name the
/// last-completed episode; `("-1", "")` means "advance to the next one".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalEpisodeRequest {
    pub episode_id_last: String,
    pub scene_id_last: String,
}

impl EvalEpisodeRequest {
    /// The "next episode" request.
    pub fn next() -> Self {
        Self {
            episode_id_last: NO_MORE_EPISODES.to_string(),
            scene_id_last: String::new(),
        }
    }
}

/// Response payload for `env/eval_episode`. `episode_id == "-1"` signals
/// iterator exhaustion and carries no meaningful metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalEpisodeResponse {
    pub episode_id: String,
    pub scene_id: String,
    pub distance_to_goal: f64,
    pub success: f64,
    pub spl: f64,
}

impl EvalEpisodeResponse {
    pub fn sentinel() -> Self {
        Self {
            episode_id: NO_MORE_EPISODES.to_string(),
            scene_id: String::new(),
            distance_to_goal: 0.0,
            success: 0.0,
            spl: 0.0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.episode_id == NO_MORE_EPISODES
    }
}

/// Request payload for `agent/reset`: reseed the policy between seed runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    pub seed: u64,
}
