//! Wire frames for the bus protocol.
//!
//! Newline-delimited JSON over TCP. Clients speak [`ClientFrame`], the
//! broker answers with [`BrokerFrame`]. Request ids are rewritten by the
//! broker so ids from different clients can never collide at a provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for every topic message: the stamp keys the agent-side join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub stamp: u64,
    pub payload: Value,
}

impl BusMessage {
    pub fn new<T: Serialize>(stamp: u64, payload: &T) -> Result<Self, super::BusError> {
        Ok(Self {
            stamp,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, super::BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Machine-readable error category carried in [`BrokerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusErrorKind {
    ServiceUnavailable,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Publish { topic: String, message: BusMessage },
    Register { service: String },
    /// Check service availability without invoking it.
    Probe { service: String, id: u64 },
    Request { service: String, id: u64, payload: Value },
    Response { id: u64, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerFrame {
    Message {
        topic: String,
        message: BusMessage,
    },
    Request {
        service: String,
        id: u64,
        payload: Value,
    },
    Response {
        id: u64,
        payload: Value,
    },
    Error {
        id: Option<u64>,
        error: BusErrorKind,
        reason: String,
    },
}
