//! Episode iteration with resume support.
//!
//! The iterator advances sequentially, can seek past an arbitrary episode
//! (resuming an interrupted run), and rewinds after reporting exhaustion so
//! a single node process can serve a multi-seed session.

use navbench_core::config::EpisodeSpec;

#[derive(Debug)]
pub struct EpisodeIterator {
    episodes: Vec<EpisodeSpec>,
    cursor: usize,
}

impl EpisodeIterator {
    pub fn new(episodes: Vec<EpisodeSpec>) -> Self {
        Self {
            episodes,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Next episode, or `None` exactly once at exhaustion; the cursor then
    /// rewinds to the beginning.
    pub fn next_episode(&mut self) -> Option<EpisodeSpec> {
        if self.cursor >= self.episodes.len() {
            self.cursor = 0;
            return None;
        }
        let episode = self.episodes[self.cursor].clone();
        self.cursor += 1;
        Some(episode)
    }

    /// Position the cursor just past `(episode_id, scene_id)`. Returns
    /// false (cursor untouched) when the episode is not in the dataset.
    pub fn seek_past(&mut self, episode_id: &str, scene_id: &str) -> bool {
        match self
            .episodes
            .iter()
            .position(|ep| ep.episode_id == episode_id && ep.scene_id == scene_id)
        {
            Some(index) => {
                self.cursor = index + 1;
                true
            }
            None => false,
        }
    }
}
