//! Sensor and action codecs.
//!
//! Sensor decoding converts wire messages into the policy's native
//! observation representation: pixels as f32, depth reshaped to H x W and
//! given an explicit trailing channel dimension of 1, the pointgoal reading
//! as a two-element vector. Action encoding has two regimes: a single
//! integer in discrete mode, and a velocity command scaled by the control
//! period in continuous mode.

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::msg::{topics, ActionMsg, DepthMsg, PointGoalMsg, RgbMsg, TwistMsg};

/// Forward translation per discrete step, in meters.
pub const FORWARD_STEP_M: f64 = 0.25;

/// Turn angle per discrete step, in degrees.
pub const TURN_ANGLE_DEG: f64 = 10.0;

/// Codec failures. Fatal to the current episode only: acting on corrupted
/// observations would corrupt the evaluation result.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{channel} message has {got} elements, expected {expected}")]
    DimensionMismatch {
        channel: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unknown action id: {0}")]
    UnknownAction(i16),
}

/// The four discrete navigation actions, with wire-visible ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentAction {
    Stop,
    MoveForward,
    TurnLeft,
    TurnRight,
}

impl AgentAction {
    pub const ALL: [AgentAction; 4] = [
        AgentAction::Stop,
        AgentAction::MoveForward,
        AgentAction::TurnLeft,
        AgentAction::TurnRight,
    ];

    pub fn id(self) -> i16 {
        match self {
            AgentAction::Stop => 0,
            AgentAction::MoveForward => 1,
            AgentAction::TurnLeft => 2,
            AgentAction::TurnRight => 3,
        }
    }

    pub fn from_id(id: i16) -> Result<Self, CodecError> {
        match id {
            0 => Ok(AgentAction::Stop),
            1 => Ok(AgentAction::MoveForward),
            2 => Ok(AgentAction::TurnLeft),
            3 => Ok(AgentAction::TurnRight),
            other => Err(CodecError::UnknownAction(other)),
        }
    }
}

/// Agent input modality; selects which sensor channels are published and
/// subscribed. The pointgoal channel is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputModality {
    Blind,
    Rgb,
    Depth,
    Rgbd,
}

impl InputModality {
    pub fn wants_rgb(self) -> bool {
        matches!(self, InputModality::Rgb | InputModality::Rgbd)
    }

    pub fn wants_depth(self) -> bool {
        matches!(self, InputModality::Depth | InputModality::Rgbd)
    }

    /// The sensor topics this modality subscribes to.
    pub fn topics(self) -> &'static [&'static str] {
        match self {
            InputModality::Blind => &[topics::POINTGOAL],
            InputModality::Rgb => &[topics::RGB, topics::POINTGOAL],
            InputModality::Depth => &[topics::DEPTH, topics::POINTGOAL],
            InputModality::Rgbd => &[topics::RGB, topics::DEPTH, topics::POINTGOAL],
        }
    }
}

impl std::str::FromStr for InputModality {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blind" => Ok(InputModality::Blind),
            "rgb" => Ok(InputModality::Rgb),
            "depth" => Ok(InputModality::Depth),
            "rgbd" => Ok(InputModality::Rgbd),
            other => Err(EvalError::Config(format!(
                "unknown input type {other:?}; expected blind, rgb, depth or rgbd"
            ))),
        }
    }
}

impl std::fmt::Display for InputModality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InputModality::Blind => "blind",
            InputModality::Rgb => "rgb",
            InputModality::Depth => "depth",
            InputModality::Rgbd => "rgbd",
        };
        f.write_str(s)
    }
}

/// RGB observation, shape (height, width, 3), row-major f32.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl RgbTensor {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, 3)
    }
}

/// Depth observation, shape (height, width, 1). The channel dimension is
/// explicit even though the backing storage is H x W.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl DepthTensor {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, 1)
    }
}

/// Policy-native observation bundle. Exactly the channels of the configured
/// modality are populated; absent channels stay `None`, never zero-filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub rgb: Option<RgbTensor>,
    pub depth: Option<DepthTensor>,
    pub pointgoal: Option<[f32; 2]>,
}

/// Decode wire messages into an observation bundle, validating dimensions.
pub fn decode_observations(
    rgb: Option<&RgbMsg>,
    depth: Option<&DepthMsg>,
    pointgoal: Option<&PointGoalMsg>,
) -> Result<Observations, CodecError> {
    let mut obs = Observations::default();

    if let Some(msg) = rgb {
        let (h, w) = (msg.height as usize, msg.width as usize);
        let expected = h * w * 3;
        if msg.data.len() != expected {
            return Err(CodecError::DimensionMismatch {
                channel: topics::RGB,
                expected,
                got: msg.data.len(),
            });
        }
        obs.rgb = Some(RgbTensor {
            height: h,
            width: w,
            data: msg.data.clone(),
        });
    }

    if let Some(msg) = depth {
        let (h, w) = (msg.height as usize, msg.width as usize);
        let expected = h * w;
        if msg.data.len() != expected {
            return Err(CodecError::DimensionMismatch {
                channel: topics::DEPTH,
                expected,
                got: msg.data.len(),
            });
        }
        obs.depth = Some(DepthTensor {
            height: h,
            width: w,
            data: msg.data.clone(),
        });
    }

    if let Some(msg) = pointgoal {
        obs.pointgoal = Some([msg.distance_to_goal, msg.angle_to_goal]);
    }

    Ok(obs)
}

pub fn rgb_to_msg(t: &RgbTensor) -> RgbMsg {
    RgbMsg {
        height: t.height as u32,
        width: t.width as u32,
        data: t.data.clone(),
    }
}

pub fn depth_to_msg(t: &DepthTensor) -> DepthMsg {
    DepthMsg {
        height: t.height as u32,
        width: t.width as u32,
        data: t.data.clone(),
    }
}

pub fn pointgoal_to_msg(pg: [f32; 2]) -> PointGoalMsg {
    PointGoalMsg {
        distance_to_goal: pg[0],
        angle_to_goal: pg[1],
    }
}

/// Encode an action for the discrete `action` channel.
pub fn action_to_msg(action: AgentAction) -> ActionMsg {
    ActionMsg { action: action.id() }
}

/// Decode a discrete action message.
pub fn msg_to_action(msg: &ActionMsg) -> Result<AgentAction, CodecError> {
    AgentAction::from_id(msg.action)
}

/// Encode an action as a velocity command for the continuous `cmd_vel`
/// channel. The command stays in effect for one control period, so the
/// magnitudes are the per-step displacement scaled by `1 / control_period`.
pub fn action_to_twist(action: AgentAction, control_period: f64) -> TwistMsg {
    let mut twist = TwistMsg::zero();
    match action {
        AgentAction::Stop => {}
        AgentAction::MoveForward => {
            twist.linear[2] = FORWARD_STEP_M / control_period;
        }
        AgentAction::TurnLeft => {
            twist.angular[1] = TURN_ANGLE_DEG.to_radians() / control_period;
        }
        AgentAction::TurnRight => {
            twist.angular[1] = -TURN_ANGLE_DEG.to_radians() / control_period;
        }
    }
    twist
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }

    #[test]
    fn test_sensor_codec_reproduces_ground_truth() {
        let rgb = RgbTensor {
            height: 4,
            width: 3,
            data: (0..4 * 3 * 3).map(|i| i as f32 * 0.5).collect(),
        };
        let depth = DepthTensor {
            height: 4,
            width: 3,
            data: (0..4 * 3).map(|i| i as f32 * 0.1).collect(),
        };
        let pg = [3.5f32, -0.7f32];

        let obs = decode_observations(
            Some(&rgb_to_msg(&rgb)),
            Some(&depth_to_msg(&depth)),
            Some(&pointgoal_to_msg(pg)),
        )
        .unwrap();

        let decoded_rgb = obs.rgb.unwrap();
        assert_eq!(decoded_rgb.shape(), (4, 3, 3));
        assert!(l2(&decoded_rgb.data, &rgb.data) < 1e-5);

        let decoded_depth = obs.depth.unwrap();
        assert_eq!(decoded_depth.shape(), (4, 3, 1));
        assert!(l2(&decoded_depth.data, &depth.data) < 1e-5);

        let decoded_pg = obs.pointgoal.unwrap();
        assert!(l2(&decoded_pg, &pg) < 1e-5);
    }

    #[test]
    fn test_absent_channels_stay_absent() {
        let pg = pointgoal_to_msg([1.0, 0.0]);
        let obs = decode_observations(None, None, Some(&pg)).unwrap();
        assert!(obs.rgb.is_none());
        assert!(obs.depth.is_none());
        assert!(obs.pointgoal.is_some());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let bad = RgbMsg {
            height: 2,
            width: 2,
            data: vec![0.0; 5],
        };
        let err = decode_observations(Some(&bad), None, None).unwrap_err();
        assert!(matches!(err, CodecError::DimensionMismatch { channel: "rgb", .. }));

        let bad_depth = DepthMsg {
            height: 2,
            width: 2,
            data: vec![0.0; 3],
        };
        let err = decode_observations(None, Some(&bad_depth), None).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DimensionMismatch { channel: "depth", .. }
        ));
    }

    #[test]
    fn test_discrete_action_round_trip() {
        for action in AgentAction::ALL {
            let msg = action_to_msg(action);
            assert_eq!(msg_to_action(&msg).unwrap(), action);
        }
        assert!(matches!(
            AgentAction::from_id(9),
            Err(CodecError::UnknownAction(9))
        ));
    }

    #[test]
    fn test_velocity_scaling() {
        for period in [0.25, 0.5, 1.0, 2.0] {
            let fwd = action_to_twist(AgentAction::MoveForward, period);
            assert!((fwd.linear[2] - 0.25 / period).abs() < 1e-12);
            assert_eq!(fwd.angular[1], 0.0);

            let left = action_to_twist(AgentAction::TurnLeft, period);
            assert!((left.angular[1] - (PI / 18.0) / period).abs() < 1e-12);

            let right = action_to_twist(AgentAction::TurnRight, period);
            assert!((right.angular[1] + (PI / 18.0) / period).abs() < 1e-12);

            assert!(action_to_twist(AgentAction::Stop, period).is_zero());
        }
    }

    #[test]
    fn test_modality_topics() {
        assert_eq!(InputModality::Blind.topics(), [topics::POINTGOAL]);
        assert_eq!(
            InputModality::Rgbd.topics(),
            [topics::RGB, topics::DEPTH, topics::POINTGOAL]
        );
        assert!("rgbd".parse::<InputModality>().is_ok());
        assert!("sonar".parse::<InputModality>().is_err());
    }
}
