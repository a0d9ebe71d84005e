//! Structured observability hooks for the evaluation lifecycle.
//!
//! Emission helpers keep the field names consistent across nodes so a
//! session can be reconstructed from interleaved logs. Events carry enough
//! context (episode id, scene id, seed) to reproduce a failure.

use tracing::{info, warn};

use crate::metrics::EpisodeMetrics;

pub fn emit_episode_started(episode_id: &str, scene_id: &str) {
    info!(event = "episode.started", episode_id = %episode_id, scene_id = %scene_id);
}

pub fn emit_episode_finished(episode_id: &str, scene_id: &str, metrics: &EpisodeMetrics) {
    info!(
        event = "episode.finished",
        episode_id = %episode_id,
        scene_id = %scene_id,
        distance_to_goal = metrics.distance_to_goal,
        success = metrics.success,
        spl = metrics.spl,
    );
}

pub fn emit_episode_aborted(episode_id: &str, scene_id: &str, reason: &str) {
    warn!(
        event = "episode.aborted",
        episode_id = %episode_id,
        scene_id = %scene_id,
        reason = %reason,
    );
}

pub fn emit_seed_finished(seed: u64, episodes: usize) {
    info!(event = "seed.finished", seed = seed, episodes = episodes);
}

pub fn emit_session_finished(seeds: usize, episodes: usize) {
    info!(event = "session.finished", seeds = seeds, episodes = episodes);
}

pub fn emit_session_stopped(reason: &str, episodes_collected: usize) {
    warn!(
        event = "session.stopped",
        reason = %reason,
        episodes_collected = episodes_collected,
    );
}
