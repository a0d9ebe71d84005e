//! navbench core library.
//!
//! Shared building blocks for the three evaluation processes: the bus
//! transport, wire messages for the well-known channels, sensor/action
//! codecs, the stamp-keyed sensor join, metrics and their aggregation,
//! task configuration, and the file log sinks.

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod logsink;
pub mod metrics;
pub mod msg;
pub mod obs;
pub mod sync;
pub mod telemetry;

pub use bus::{Broker, BusClient, BusError, BusMessage, ServiceRequest};
pub use codec::{AgentAction, CodecError, InputModality, Observations};
pub use config::{EpisodeSpec, SimMode, TaskConfig};
pub use error::{EvalError, Result};
pub use metrics::{average_metrics, EpisodeHandle, EpisodeMetrics};
pub use msg::{EvalEpisodeRequest, EvalEpisodeResponse, NO_MORE_EPISODES};
pub use sync::{SyncedBundle, TimeSynchronizer};
