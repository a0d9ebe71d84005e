//! Policy seam and the goal-seeking reference policy.
//!
//! Checkpoint-backed neural policies sit behind the same trait; the node
//! never knows which one it is driving.

use std::f32::consts::PI;

use navbench_core::codec::{AgentAction, Observations, TURN_ANGLE_DEG};

pub trait Policy: Send {
    /// Reseed internal randomness before a seed run.
    fn reset(&mut self, seed: u64);

    /// One observation bundle in, one action out.
    fn act(&mut self, observations: &Observations) -> AgentAction;
}

/// Steers by the pointgoal vector: turn until the bearing is within
/// tolerance, otherwise walk forward, stop when close. When the goal is
/// almost directly behind, the turn direction is a seeded coin flip so
/// different seeds realize different paths.
pub struct GoalSeekPolicy {
    rng: fastrand::Rng,
    stop_distance: f32,
    turn_tolerance: f32,
}

impl GoalSeekPolicy {
    pub fn new(stop_distance: f32) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(0),
            stop_distance,
            // half the turn increment, so the heading cannot oscillate
            // around the goal bearing
            turn_tolerance: ((TURN_ANGLE_DEG / 2.0).to_radians()) as f32,
        }
    }
}

impl Policy for GoalSeekPolicy {
    fn reset(&mut self, seed: u64) {
        self.rng = fastrand::Rng::with_seed(seed);
    }

    fn act(&mut self, observations: &Observations) -> AgentAction {
        let Some([distance, angle]) = observations.pointgoal else {
            return AgentAction::Stop;
        };
        if distance <= self.stop_distance {
            return AgentAction::Stop;
        }
        if angle.abs() <= self.turn_tolerance {
            return AgentAction::MoveForward;
        }
        if angle.abs() >= PI - self.turn_tolerance {
            // goal directly behind: either turn direction is as good
            return if self.rng.bool() {
                AgentAction::TurnLeft
            } else {
                AgentAction::TurnRight
            };
        }
        if angle > 0.0 {
            AgentAction::TurnLeft
        } else {
            AgentAction::TurnRight
        }
    }
}
