//! navbench agent node.
//!
//! Joins stamped sensor messages per the configured modality, feeds them to
//! a [`Policy`], and publishes the resulting action or velocity command.

pub mod node;
pub mod policy;

pub use node::{actuation_gate, AgentConfig, AgentNode};
pub use policy::{GoalSeekPolicy, Policy};
