use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide counters. All three fields are updated independently with
/// atomics; each is individually monotone, but a snapshot may catch them at
/// slightly different points in time relative to one another (spec'd
/// behavior, not a bug).
#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug, Clone)]
pub struct Accountant {
    counters: Arc<Counters>,
}

impl Accountant {
    pub fn new() -> Self {
        Accountant {
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn record_connection(&self) {
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream(&self, n: u64) {
        self.counters.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_downstream(&self, n: u64) {
        self.counters.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.counters.connections.load(Ordering::Relaxed),
            bytes_up: self.counters.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.counters.bytes_down.load(Ordering::Relaxed),
        }
    }

    /// Write the snapshot to `path` via a temp-file-then-rename so a
    /// concurrent reader never observes a partially written file.
    pub async fn write_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = self.snapshot();
        let body = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = tmp_sibling(path);
        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Background task: emit a summary log line and refresh the stats
    /// snapshot file every `interval`, until `shutdown` fires.
    pub async fn run_reporter(self, stats_path: PathBuf, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = self.snapshot();
                    info!(
                        connections = s.connections,
                        bytes_up = s.bytes_up,
                        bytes_down = s.bytes_down,
                        "accountant summary"
                    );
                    if let Err(err) = self.write_snapshot(&stats_path).await {
                        warn!(error = %err, path = %stats_path.display(), "failed to write stats snapshot");
                    }
                }
                _ = shutdown.cancelled() => {
                    let _ = self.write_snapshot(&stats_path).await;
                    return;
                }
            }
        }
    }
}

impl Default for Accountant {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
