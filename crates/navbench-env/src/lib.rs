//! navbench environment node.
//!
//! Hosts the simulator, serves the blocking episode-control call, and
//! publishes stamped sensor observations while consuming action or velocity
//! commands, depending on the configured regime.

pub mod dataset;
pub mod node;
pub mod sim;

pub use dataset::EpisodeIterator;
pub use node::EnvNode;
pub use sim::{PlanarSim, Simulator};
