use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sandbox::{ExecutionResult, Outcome};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a sandbox:
/// `Provisioning -> Ready -> Running <-> Idle -> Expired -> Reclaimed`,
/// with `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Provisioning,
    Ready,
    Running,
    Idle,
    Expired,
    Reclaimed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: Uuid,
    /// Canonical language id (aliases already resolved).
    pub language: String,
    /// Derived from `id` and the profile extension only.
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub extension_count: u32,
    pub state: SandboxState,
    pub last_result: Option<ExecutionResult>,
    /// Present while an execution is in flight.
    pub cancel: Option<CancellationToken>,
    /// Set by `terminate`; the sandbox is reclaimed once nothing runs on it.
    pub retiring: bool,
    /// A reclaimer has claimed the storage deletion.
    pub deleting: bool,
    pub reclaimed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl SandboxRecord {
    pub fn new(
        id: Uuid,
        language: String,
        source_path: PathBuf,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            language,
            source_path,
            created_at,
            expires_at,
            extension_count: 0,
            state: SandboxState::Provisioning,
            last_result: None,
            cancel: None,
            retiring: false,
            deleting: false,
            reclaimed_at: None,
            failure: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            id: self.id,
            language: self.language.clone(),
            state: self.state,
            created_at: self.created_at,
            expires_at: self.expires_at,
            extension_count: self.extension_count,
            last_outcome: self.last_result.as_ref().map(|r| r.outcome),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        SandboxStatus {
            summary: self.summary(),
            failure: self.failure.clone(),
            last_result: self.last_result.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub id: Uuid,
    pub language: String,
    pub state: SandboxState,
    #[serde(serialize_with = "serialize_iso")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    pub expires_at: DateTime<Utc>,
    pub extension_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Outcome>,
}

/// Summary plus the last result, served to pollers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(flatten)]
    pub summary: SandboxSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub last_result: Option<ExecutionResult>,
}

/// Serialize as ISO 8601 with millisecond precision, matching JS `Date.toISOString()`.
pub(crate) fn serialize_iso<S: serde::Serializer>(
    dt: &DateTime<Utc>,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_iso(dt))
}

pub(crate) fn format_iso(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
