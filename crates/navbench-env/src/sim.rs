//! Simulator seam and the planar reference simulator.
//!
//! The real physics/rendering simulator is an external collaborator; the
//! node only needs the contract below. `PlanarSim` is the deterministic
//! in-crate implementation backing the binary and the tests: flat ground,
//! no obstacles, straight-line geodesics, synthetic sensor imagery.

use std::f64::consts::{PI, TAU};

use navbench_core::codec::{AgentAction, DepthTensor, Observations, RgbTensor};
use navbench_core::codec::{FORWARD_STEP_M, TURN_ANGLE_DEG};
use navbench_core::config::EpisodeSpec;
use navbench_core::msg::TwistMsg;

/// The environment node's view of a simulator. All mutation happens inside
/// the single step loop driven by the blocking episode-control call; the
/// trait is never accessed concurrently.
pub trait Simulator: Send {
    /// Load an episode: place the agent at the start pose, set the goal.
    fn load_episode(&mut self, episode: &EpisodeSpec);

    /// Current observations, all channels populated; the node publishes
    /// the modality subset.
    fn observations(&self) -> Observations;

    /// Discrete step: apply one action.
    fn apply_action(&mut self, action: AgentAction);

    /// Continuous step: integrate under a velocity command for `dt`
    /// seconds. Only `linear[2]` (forward) and `angular[1]` (yaw) apply.
    fn integrate(&mut self, twist: &TwistMsg, dt: f64);

    /// Agent position, used to track realized path length.
    fn position(&self) -> (f64, f64);

    fn distance_to_goal(&self) -> f64;

    /// Shortest-path distance from the episode start to the goal.
    fn geodesic_distance(&self) -> f64;

    /// Simulator-reported terminal condition (e.g. irrecoverable state).
    fn is_done(&self) -> bool {
        false
    }
}

fn normalize_angle(a: f64) -> f64 {
    let mut a = a % TAU;
    if a > PI {
        a -= TAU;
    } else if a < -PI {
        a += TAU;
    }
    a
}

/// Deterministic planar simulator.
///
/// Pose is (x, y, heading); heading 0 faces +x, positive turns are
/// counter-clockwise (left). Pixel data is a deterministic function of the
/// frame counter so sensor-codec behavior is reproducible end to end.
pub struct PlanarSim {
    resolution: u32,
    x: f64,
    y: f64,
    heading: f64,
    start: (f64, f64),
    goal: (f64, f64),
    frame: u64,
}

impl PlanarSim {
    pub fn new(resolution: u32) -> Self {
        Self {
            resolution,
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            start: (0.0, 0.0),
            goal: (0.0, 0.0),
            frame: 0,
        }
    }

    pub fn pose(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.heading)
    }

    fn bearing_to_goal(&self) -> f64 {
        let world = (self.goal.1 - self.y).atan2(self.goal.0 - self.x);
        normalize_angle(world - self.heading)
    }
}

impl Simulator for PlanarSim {
    fn load_episode(&mut self, episode: &EpisodeSpec) {
        self.x = episode.start[0];
        self.y = episode.start[1];
        self.heading = normalize_angle(episode.start[2]);
        self.start = (episode.start[0], episode.start[1]);
        self.goal = (episode.goal[0], episode.goal[1]);
        self.frame = 0;
    }

    fn observations(&self) -> Observations {
        let res = self.resolution as usize;
        let rgb = RgbTensor {
            height: res,
            width: res,
            data: (0..res * res * 3)
                .map(|i| ((i as u64 + self.frame) % 256) as f32)
                .collect(),
        };
        let depth = DepthTensor {
            height: res,
            width: res,
            data: (0..res * res)
                .map(|i| ((i as u64 * 7 + self.frame) % 100) as f32 / 10.0)
                .collect(),
        };
        Observations {
            rgb: Some(rgb),
            depth: Some(depth),
            pointgoal: Some([self.distance_to_goal() as f32, self.bearing_to_goal() as f32]),
        }
    }

    fn apply_action(&mut self, action: AgentAction) {
        match action {
            AgentAction::Stop => {}
            AgentAction::MoveForward => {
                self.x += FORWARD_STEP_M * self.heading.cos();
                self.y += FORWARD_STEP_M * self.heading.sin();
            }
            AgentAction::TurnLeft => {
                self.heading = normalize_angle(self.heading + TURN_ANGLE_DEG.to_radians());
            }
            AgentAction::TurnRight => {
                self.heading = normalize_angle(self.heading - TURN_ANGLE_DEG.to_radians());
            }
        }
        self.frame += 1;
    }

    fn integrate(&mut self, twist: &TwistMsg, dt: f64) {
        self.heading = normalize_angle(self.heading + twist.angular[1] * dt);
        let v = twist.linear[2];
        self.x += v * self.heading.cos() * dt;
        self.y += v * self.heading.sin() * dt;
        self.frame += 1;
    }

    fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    fn distance_to_goal(&self) -> f64 {
        (self.goal.0 - self.x).hypot(self.goal.1 - self.y)
    }

    fn geodesic_distance(&self) -> f64 {
        (self.goal.0 - self.start.0).hypot(self.goal.1 - self.start.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(start: [f64; 3], goal: [f64; 2]) -> EpisodeSpec {
        EpisodeSpec {
            episode_id: "0".to_string(),
            scene_id: "test".to_string(),
            start,
            goal,
        }
    }

    #[test]
    fn test_forward_step_moves_quarter_meter() {
        let mut sim = PlanarSim::new(8);
        sim.load_episode(&episode([0.0, 0.0, 0.0], [1.0, 0.0]));
        sim.apply_action(AgentAction::MoveForward);
        let (x, y) = sim.position();
        assert!((x - 0.25).abs() < 1e-12);
        assert!(y.abs() < 1e-12);
        assert!((sim.distance_to_goal() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_turns_change_bearing() {
        let mut sim = PlanarSim::new(8);
        sim.load_episode(&episode([0.0, 0.0, 0.0], [0.0, 1.0]));
        // goal is straight to the left: bearing +pi/2
        let pg = sim.observations().pointgoal.unwrap();
        assert!((pg[1] - std::f32::consts::FRAC_PI_2).abs() < 1e-5);

        for _ in 0..9 {
            sim.apply_action(AgentAction::TurnLeft);
        }
        let pg = sim.observations().pointgoal.unwrap();
        assert!(pg[1].abs() < 1e-5);
    }

    #[test]
    fn test_integration_matches_discrete_displacement() {
        // a 0.25/period forward command integrated over one period moves
        // one discrete step
        let period = 0.5;
        let mut sim = PlanarSim::new(8);
        sim.load_episode(&episode([0.0, 0.0, 0.0], [1.0, 0.0]));
        let twist = navbench_core::codec::action_to_twist(AgentAction::MoveForward, period);
        let dt = 0.05;
        let mut t = 0.0;
        while t < period - 1e-9 {
            sim.integrate(&twist, dt);
            t += dt;
        }
        let (x, _) = sim.position();
        assert!((x - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_observations_are_deterministic() {
        let mut a = PlanarSim::new(4);
        let mut b = PlanarSim::new(4);
        let ep = episode([0.0, 0.0, 0.0], [1.0, 0.0]);
        a.load_episode(&ep);
        b.load_episode(&ep);
        a.apply_action(AgentAction::MoveForward);
        b.apply_action(AgentAction::MoveForward);
        assert_eq!(a.observations().rgb, b.observations().rgb);
        assert_eq!(a.observations().depth, b.observations().depth);
    }
}
