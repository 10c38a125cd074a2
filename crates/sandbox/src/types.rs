use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::LanguageProfile;

pub struct ExecRequest<'a> {
    pub profile: &'a LanguageProfile,
    /// Stored source file. The worker copies it; the original is never touched.
    pub source: &'a Path,
    /// Fired by `terminate`; the worker kills the process group and reports
    /// [`Outcome::Cancelled`].
    pub cancel: CancellationToken,
}

/// How an execution ended, from the point of view of the submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Timeout,
    Crashed,
    Cancelled,
    ResourceExhausted,
}

impl Outcome {
    /// External error code for non-completed outcomes.
    pub fn error_code(self) -> Option<&'static str> {
        match self {
            Self::Completed => None,
            Self::Timeout => Some("ExecutionTimeout"),
            Self::Crashed => Some("ExecutionCrashed"),
            Self::Cancelled => Some("Cancelled"),
            Self::ResourceExhausted => Some("ResourceExhausted"),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Timeout => f.write_str("timeout"),
            Self::Crashed => f.write_str("crashed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::ResourceExhausted => f.write_str("resource_exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub outcome: Outcome,
    pub phase: Phase,
}

impl ExecutionResult {
    /// Result for an execution cancelled before any process was spawned.
    pub fn cancelled(elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            duration_ms: elapsed.as_millis() as u64,
            truncated: false,
            outcome: Outcome::Cancelled,
            phase: Phase::Run,
        }
    }
}
