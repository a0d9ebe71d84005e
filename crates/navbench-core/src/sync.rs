//! Stamp-keyed join over sensor channels.
//!
//! The agent node must never act on a partially-updated observation: a
//! bundle is delivered only when every subscribed channel holds a message
//! for the same stamp. Stamps are monotonic within one environment-node
//! process, so a fired stamp also retires everything older.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::bus::BusMessage;

/// A complete set of channel payloads sharing one stamp.
#[derive(Debug)]
pub struct SyncedBundle {
    pub stamp: u64,
    messages: HashMap<String, Value>,
}

impl SyncedBundle {
    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.messages.get(channel)
    }
}

/// Explicit join primitive: buffers per-channel messages keyed by stamp and
/// fires once per stamp, in stamp order, when the set is complete. Bounded:
/// beyond `queue_size` pending stamps, the oldest incomplete stamp is
/// dropped (that tick's action is simply never produced).
#[derive(Debug)]
pub struct TimeSynchronizer {
    channels: Vec<String>,
    queue_size: usize,
    pending: BTreeMap<u64, HashMap<String, Value>>,
    last_fired: Option<u64>,
}

impl TimeSynchronizer {
    pub fn new<I, S>(channels: I, queue_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            queue_size: queue_size.max(1),
            pending: BTreeMap::new(),
            last_fired: None,
        }
    }

    /// Offer a message for a channel. Returns a bundle when the message
    /// completes its stamp. Messages for unknown channels or for stamps at
    /// or before the last fired one are discarded.
    pub fn insert(&mut self, channel: &str, message: BusMessage) -> Option<SyncedBundle> {
        if !self.channels.iter().any(|c| c == channel) {
            return None;
        }
        if self.last_fired.is_some_and(|fired| message.stamp <= fired) {
            return None;
        }

        let stamp = message.stamp;
        let entry = self.pending.entry(stamp).or_default();
        entry.insert(channel.to_string(), message.payload);

        if entry.len() == self.channels.len() {
            let messages = self.pending.remove(&stamp)?;
            // everything older can no longer fire in order
            self.pending.retain(|&s, _| s > stamp);
            self.last_fired = Some(stamp);
            return Some(SyncedBundle { stamp, messages });
        }

        while self.pending.len() > self.queue_size {
            self.pending.pop_first();
        }
        None
    }

    /// Drop all buffered messages. The fired-stamp watermark is kept so a
    /// late message from before the reset can never fire.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_stamps(&self) -> usize {
        self.pending.len()
    }
}
