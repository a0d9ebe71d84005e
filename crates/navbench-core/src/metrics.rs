//! Episode metrics and their aggregation.
//!
//! Averaging is a plain per-key arithmetic mean and is applied twice during
//! a session: once over the episodes of a seed, once over the per-seed
//! averages. With equal episode counts per seed the two-level mean equals
//! the grand mean, which is what the aggregation tests pin down.

use serde::{Deserialize, Serialize};

/// Identifies one evaluation unit within a scene dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeHandle {
    pub episode_id: String,
    pub scene_id: String,
}

/// Terminal metrics of one episode. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub distance_to_goal: f64,
    pub success: f64,
    pub spl: f64,
}

impl EpisodeMetrics {
    /// Failure metrics for an aborted episode (action timeout, malformed
    /// data): not successful, zero SPL, distance as it stood at the abort.
    pub fn failure(distance_to_goal: f64) -> Self {
        Self {
            distance_to_goal,
            success: 0.0,
            spl: 0.0,
        }
    }

    /// Metric keys and values in a stable order, for log sinks.
    pub fn as_pairs(&self) -> [(&'static str, f64); 3] {
        [
            ("distance_to_goal", self.distance_to_goal),
            ("success", self.success),
            ("spl", self.spl),
        ]
    }
}

/// Arithmetic mean per metric key. Returns `None` for an empty input.
/// Associative across levels: records may be per-episode metrics or
/// per-seed averages, the operation does not distinguish the two.
pub fn average_metrics<'a, I>(records: I) -> Option<EpisodeMetrics>
where
    I: IntoIterator<Item = &'a EpisodeMetrics>,
{
    let mut sum = EpisodeMetrics {
        distance_to_goal: 0.0,
        success: 0.0,
        spl: 0.0,
    };
    let mut count = 0u32;
    for m in records {
        sum.distance_to_goal += m.distance_to_goal;
        sum.success += m.success;
        sum.spl += m.spl;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let n = f64::from(count);
    Some(EpisodeMetrics {
        distance_to_goal: sum.distance_to_goal / n,
        success: sum.success / n,
        spl: sum.spl / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(d: f64, s: f64, spl: f64) -> EpisodeMetrics {
        EpisodeMetrics {
            distance_to_goal: d,
            success: s,
            spl,
        }
    }

    #[test]
    fn test_empty_average_is_none() {
        assert!(average_metrics([].iter()).is_none());
    }

    #[test]
    fn test_single_record_average_is_identity() {
        let one = m(1.5, 1.0, 0.8);
        assert_eq!(average_metrics([one].iter()).unwrap(), one);
    }

    #[test]
    fn test_two_level_average_matches_grand_average() {
        // two seeds, two episodes each
        let seed_a = [m(1.0, 1.0, 0.9), m(3.0, 0.0, 0.0)];
        let seed_b = [m(2.0, 1.0, 0.7), m(4.0, 1.0, 0.5)];

        let avg_a = average_metrics(seed_a.iter()).unwrap();
        let avg_b = average_metrics(seed_b.iter()).unwrap();
        let two_level = average_metrics([avg_a, avg_b].iter()).unwrap();

        let all: Vec<_> = seed_a.iter().chain(seed_b.iter()).cloned().collect();
        let grand = average_metrics(all.iter()).unwrap();

        assert!((two_level.distance_to_goal - grand.distance_to_goal).abs() < 1e-12);
        assert!((two_level.success - grand.success).abs() < 1e-12);
        assert!((two_level.spl - grand.spl).abs() < 1e-12);
    }

    #[test]
    fn test_failure_metrics() {
        let f = EpisodeMetrics::failure(4.2);
        assert_eq!(f.success, 0.0);
        assert_eq!(f.spl, 0.0);
        assert_eq!(f.distance_to_goal, 4.2);
    }
}
