//! Error taxonomy for the evaluation harness.
//!
//! Three blast radii, enforced by callers:
//! - transport errors stop the session but keep already-collected results;
//! - codec and action-timeout errors abort the current episode only;
//! - configuration errors are fatal at startup, before any node is spawned.

use crate::bus::BusError;
use crate::codec::CodecError;

/// Harness-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("transport error: {0}")]
    Bus(#[from] BusError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("episode {episode_id} aborted: {reason}")]
    EpisodeAborted { episode_id: String, reason: String },

    #[error("not supported in the bridged configuration: {0}")]
    NotSupported(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvalError::Config("mode must be discrete or continuous".to_string());
        assert!(err.to_string().contains("invalid configuration"));

        let err = EvalError::EpisodeAborted {
            episode_id: "7".to_string(),
            reason: "action timeout".to_string(),
        };
        assert!(err.to_string().contains("episode 7 aborted"));

        let err = EvalError::NotSupported("map generation");
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_bus_error_converts() {
        let err: EvalError = BusError::Closed.into();
        assert!(matches!(err, EvalError::Bus(_)));
    }
}
