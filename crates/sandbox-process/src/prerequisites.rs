use std::path::Path;
use std::time::Duration;

use sandbox::{LanguageProfile, Phase, ResourceLimits, SandboxError};
use tokio_util::sync::CancellationToken;

use crate::config::ProcessConfig;
use crate::paths::RunDir;
use crate::process::{self, Invocation};

const ISOLATION_CHECK_LIMITS: ResourceLimits = ResourceLimits {
    cpu_ms: 1_000,
    memory_mb: 256,
    wall_clock_ms: 10_000,
    max_output_bytes: 1024,
};

/// Verify the host can run process sandboxes at all.
///
/// Checks that `sh` resolves on the user search path, that the run root
/// exists (creating it if needed) and is writable, and that a jailed `sh`
/// actually runs (the kernel may forbid unprivileged user namespaces).
/// Collects all failures and returns them in a single `BackendNotAvailable`
/// error.
pub async fn check_prerequisites(config: &ProcessConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    if which::which_in("sh", Some(&config.search_path), "/").is_err() {
        errors.push(format!("sh not found on PATH {}", config.search_path));
    }
    ensure_run_root(&config.run_root, &mut errors).await;
    if errors.is_empty()
        && let Err(e) = run_jailed_shell(config).await
    {
        errors.push(format!("process isolation unavailable: {e}"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

async fn ensure_run_root(root: &Path, errors: &mut Vec<String>) {
    if let Err(e) = tokio::fs::create_dir_all(root).await {
        errors.push(format!("failed to create {}: {e}", root.display()));
        return;
    }
    if let Err(e) = tempfile::tempfile_in(root) {
        errors.push(format!("{} is not writable: {e}", root.display()));
    }
}

async fn run_jailed_shell(config: &ProcessConfig) -> Result<(), SandboxError> {
    let run_dir = RunDir::empty(config, "check.sh".into())?;
    let argv = ["sh", "-c", "test \"$(pwd)\" = /sandbox"].map(String::from);
    let limits = ISOLATION_CHECK_LIMITS;
    let finished = process::run(&Invocation {
        argv: &argv,
        jail: run_dir.jail(),
        limits: &limits,
        timeout: limits.wall_clock(),
        search_path: &config.search_path,
        cancel: &CancellationToken::new(),
    })
    .await?;
    if finished.succeeded() {
        Ok(())
    } else {
        let result = finished.into_result(Phase::Run, Duration::ZERO, limits.max_output_bytes);
        Err(SandboxError::ExecFailed(format!(
            "jailed sh did not succeed ({}): {}",
            result.outcome,
            result.stderr.trim()
        )))
    }
}

/// Programs a profile needs that cannot be found on `search_path`.
pub fn missing_programs(profile: &LanguageProfile, search_path: &str) -> Vec<String> {
    profile
        .required_programs()
        .into_iter()
        .filter(|program| which::which_in(program, Some(search_path), "/").is_err())
        .map(str::to_string)
        .collect()
}
