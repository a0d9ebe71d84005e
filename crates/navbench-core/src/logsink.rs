//! File log sinks for evaluation results.
//!
//! One summary log per session, one per seed, one per episode, each
//! receiving `key,value` metric lines. Paths are derived from the seed and
//! the episode/scene identifiers so an interrupted run can be picked apart
//! afterwards.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Buffered line-oriented log file.
pub struct MetricsLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl MetricsLog {
    /// Create (truncate) the log file, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.writer, "{text}")
    }

    /// A `key,value` metric line.
    pub fn metric(&mut self, key: &str, value: f64) -> io::Result<()> {
        writeln!(self.writer, "{key},{value}")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// `<log_dir>/episode=<id>-scene=<basename>.log`
pub fn episode_log_path(log_dir: &Path, episode_id: &str, scene_id: &str) -> PathBuf {
    let scene = Path::new(scene_id)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| scene_id.to_string());
    log_dir.join(format!("episode={episode_id}-scene={scene}.log"))
}

/// `<log_dir>/summary-seed=<seed>.log`
pub fn seed_log_path(log_dir: &Path, seed: u64) -> PathBuf {
    log_dir.join(format!("summary-seed={seed}.log"))
}

/// `<log_dir>/seed=<seed>/` — per-episode logs of one seed run.
pub fn seed_episode_dir(log_dir: &Path, seed: u64) -> PathBuf {
    log_dir.join(format!("seed={seed}"))
}

/// `<log_dir>/summary-all_seeds.log`
pub fn summary_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join("summary-all_seeds.log")
}
