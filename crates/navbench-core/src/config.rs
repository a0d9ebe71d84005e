//! Task configuration, loaded from TOML.
//!
//! Configuration problems are fatal at startup: the evaluator validates the
//! task file before spawning any node.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// Simulation regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimMode {
    /// Turn-based stepping, one action per tick, no physics integration.
    Discrete,
    /// Fixed-period velocity control with integration between ticks.
    Continuous,
}

/// One episode of the dataset: identifiers, start pose, goal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSpec {
    pub episode_id: String,
    pub scene_id: String,
    /// x, y, heading (radians).
    pub start: [f64; 3],
    /// x, y.
    pub goal: [f64; 2],
}

/// Full task configuration for one evaluation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub mode: SimMode,

    #[serde(default = "default_max_episode_steps")]
    pub max_episode_steps: u32,

    #[serde(default = "default_success_distance")]
    pub success_distance: f64,

    /// Sensor publication rate in Hz; CLI flags may override it.
    #[serde(default = "default_sensor_pub_rate")]
    pub sensor_pub_rate: f64,

    /// Seconds a continuous velocity command stays in effect.
    #[serde(default = "default_control_period")]
    pub control_period: f64,

    /// Discrete mode: how long the environment node waits for an action
    /// before aborting the episode with failure metrics.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_s: f64,

    /// Continuous mode: wall-clock budget per episode.
    #[serde(default = "default_max_duration")]
    pub max_duration_s: f64,

    /// Square sensor image resolution.
    #[serde(default = "default_resolution")]
    pub resolution: u32,

    pub episodes: Vec<EpisodeSpec>,
}

fn default_max_episode_steps() -> u32 {
    500
}

fn default_success_distance() -> f64 {
    0.2
}

fn default_sensor_pub_rate() -> f64 {
    5.0
}

fn default_control_period() -> f64 {
    1.0
}

fn default_action_timeout() -> f64 {
    10.0
}

fn default_max_duration() -> f64 {
    60.0
}

fn default_resolution() -> u32 {
    32
}

impl TaskConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            EvalError::Config(format!("cannot read task config {}: {err}", path.display()))
        })?;
        let config: TaskConfig = toml::from_str(&contents).map_err(|err| {
            EvalError::Config(format!("invalid task config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.episodes.is_empty() {
            return Err(EvalError::Config("episode dataset is empty".into()));
        }
        if self.sensor_pub_rate <= 0.0 {
            return Err(EvalError::Config("sensor_pub_rate must be positive".into()));
        }
        if self.control_period <= 0.0 {
            return Err(EvalError::Config("control_period must be positive".into()));
        }
        if self.action_timeout_s <= 0.0 {
            return Err(EvalError::Config("action_timeout_s must be positive".into()));
        }
        if self.success_distance <= 0.0 {
            return Err(EvalError::Config("success_distance must be positive".into()));
        }
        if self.resolution == 0 {
            return Err(EvalError::Config("resolution must be positive".into()));
        }
        for (i, ep) in self.episodes.iter().enumerate() {
            if ep.episode_id.is_empty() || ep.episode_id == "-1" {
                return Err(EvalError::Config(format!(
                    "episode {i} has reserved or empty episode_id"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for ep in &self.episodes {
            if !seen.insert((ep.episode_id.as_str(), ep.scene_id.as_str())) {
                return Err(EvalError::Config(format!(
                    "duplicate episode {} in scene {}",
                    ep.episode_id, ep.scene_id
                )));
            }
        }
        Ok(())
    }
}
