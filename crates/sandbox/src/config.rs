use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Placeholder replaced with the absolute path of the materialized source file.
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced with the compiled artifact path (compiled runtimes only).
pub const BINARY_PLACEHOLDER: &str = "{binary}";
/// Placeholder replaced with the per-run working directory.
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// Per-execution resource ceilings. Enforced by the worker, not the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_ms: u64,
    pub memory_mb: u64,
    pub wall_clock_ms: u64,
    /// Cap applied to each captured stream independently.
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms)
    }

    /// CPU budget rounded up to whole seconds, the granularity of `RLIMIT_CPU`.
    pub fn cpu_secs(&self) -> u64 {
        self.cpu_ms.div_ceil(1000).max(1)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Source is handed straight to an interpreter.
    Interpreted,
    /// Source is compiled to `{binary}` first, then the binary is run.
    Compiled,
}

/// Static description of how to run one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Includes the leading dot, e.g. `.py`.
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub limits: ResourceLimits,
    /// Wall-clock budget for the compile step. Defaults to `limits.wall_clock_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_wall_clock_ms: Option<u64>,
}

impl LanguageProfile {
    pub fn kind(&self) -> RuntimeKind {
        if self.compile_command.is_some() {
            RuntimeKind::Compiled
        } else {
            RuntimeKind::Interpreted
        }
    }

    /// File name the source is materialized under inside a run directory.
    pub fn entry_file(&self) -> String {
        format!("main{}", self.file_extension)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(
            self.compile_wall_clock_ms
                .unwrap_or(self.limits.wall_clock_ms),
        )
    }

    /// Host programs this profile invokes (placeholders excluded).
    pub fn required_programs(&self) -> Vec<&str> {
        let mut programs = Vec::new();
        if let Some(program) = self.compile_command.as_ref().and_then(|c| c.first()) {
            programs.push(program.as_str());
        }
        if let Some(program) = self.run_command.first()
            && !program.contains('{')
        {
            programs.push(program.as_str());
        }
        programs
    }

    /// Reject profiles that could not be executed or whose extension could
    /// escape the scratch directory when joined onto a sandbox id.
    pub fn validate(&self) -> Result<()> {
        let id = &self.language_id;
        if id.is_empty() {
            return Err(SandboxError::InvalidProfile("empty language id".into()));
        }

        let ext = self.file_extension.strip_prefix('.').ok_or_else(|| {
            SandboxError::InvalidProfile(format!("{id}: extension must start with '.'"))
        })?;
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SandboxError::InvalidProfile(format!(
                "{id}: extension must be alphanumeric: {}",
                self.file_extension
            )));
        }

        if self.run_command.is_empty() {
            return Err(SandboxError::InvalidProfile(format!("{id}: empty run command")));
        }
        match &self.compile_command {
            Some(cmd) if cmd.is_empty() => {
                return Err(SandboxError::InvalidProfile(format!(
                    "{id}: empty compile command"
                )));
            }
            Some(cmd) if !cmd.iter().any(|a| a.contains(BINARY_PLACEHOLDER)) => {
                return Err(SandboxError::InvalidProfile(format!(
                    "{id}: compile command must produce {BINARY_PLACEHOLDER}"
                )));
            }
            _ => {}
        }

        let limits = &self.limits;
        if limits.cpu_ms == 0
            || limits.memory_mb == 0
            || limits.wall_clock_ms == 0
            || limits.max_output_bytes == 0
        {
            return Err(SandboxError::InvalidProfile(format!(
                "{id}: resource limits must be non-zero"
            )));
        }
        Ok(())
    }
}
