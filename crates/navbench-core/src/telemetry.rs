//! Tracing setup shared by the evaluator, env, and agent binaries.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the process-wide subscriber. `level` is the fallback when
/// `RUST_LOG` is unset; `json` switches the output to newline-delimited
/// JSON for log collectors. A second call in the same process is a no-op.
pub fn init_tracing(json: bool, level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let format = fmt::layer().with_target(false);
    let format = if json {
        format.json().boxed()
    } else {
        format.boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .ok();
}
