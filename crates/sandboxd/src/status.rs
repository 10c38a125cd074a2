use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::serialize_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Running,
    Draining,
    Stopped,
}

/// Counters published after every reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub active_sandboxes: usize,
    pub running_executions: usize,
    pub queued_executions: usize,
}

/// Contents of `status.json`.
#[derive(Debug, Clone, Serialize)]
struct Published {
    mode: ServiceMode,
    pid: u32,
    #[serde(flatten)]
    occupancy: Occupancy,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Publishes service mode and occupancy to a JSON file that supervisors
/// can read without talking to the HTTP API.
pub struct StatusTracker {
    path: PathBuf,
    current: Mutex<Published>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            path,
            current: Mutex::new(Published {
                mode: ServiceMode::Running,
                pid: std::process::id(),
                occupancy: Occupancy::default(),
                started_at: now,
                updated_at: now,
            }),
        }
    }

    pub async fn write_initial(&self) {
        let mut current = self.current.lock().await;
        self.publish(&mut current).await;
    }

    pub async fn set_mode(&self, mode: ServiceMode) {
        let mut current = self.current.lock().await;
        current.mode = mode;
        self.publish(&mut current).await;
    }

    /// Only rewrites the file when the counters changed.
    pub async fn set_occupancy(&self, occupancy: Occupancy) {
        let mut current = self.current.lock().await;
        if current.occupancy == occupancy {
            return;
        }
        current.occupancy = occupancy;
        self.publish(&mut current).await;
    }

    async fn publish(&self, current: &mut Published) {
        current.updated_at = Utc::now();
        let bytes = match serde_json::to_vec_pretty(current) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot encode status");
                return;
            }
        };
        match replace_file(&self.path, &bytes).await {
            Ok(()) => debug!(mode = ?current.mode, "status published"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot publish status"),
        }
    }
}

/// Readers see either the old file or the new one, never a partial write.
async fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let staging = path.with_extension("json.partial");
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, path).await
}
