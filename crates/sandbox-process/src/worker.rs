use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecutionResult, ExecutionWorker, LanguageProfile, Phase, ResourceLimits,
    SandboxError,
};
use tracing::{debug, info};

use crate::config::ProcessConfig;
use crate::paths::RunDir;
use crate::process::{self, Invocation};

/// Compilers need far more address space than the programs they build.
const COMPILE_MEMORY_FLOOR_MB: u64 = 2048;

/// Runs the stored source directly under the profile's interpreter.
pub struct InterpretedWorker {
    config: Arc<ProcessConfig>,
}

impl InterpretedWorker {
    pub fn new(config: Arc<ProcessConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutionWorker for InterpretedWorker {
    fn name(&self) -> &str {
        "interpreted"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecutionResult> {
        let started = Instant::now();
        if request.cancel.is_cancelled() {
            return Ok(ExecutionResult::cancelled(started.elapsed()));
        }
        let profile = request.profile;
        let run_dir = RunDir::create(&self.config, profile, request.source).await?;

        let argv = run_dir.render(&profile.run_command);
        let finished = process::run(&Invocation {
            argv: &argv,
            jail: run_dir.jail(),
            limits: &profile.limits,
            timeout: profile.limits.wall_clock(),
            search_path: &self.config.search_path,
            cancel: &request.cancel,
        })
        .await?;

        let result = finished.into_result(
            Phase::Run,
            started.elapsed(),
            profile.limits.max_output_bytes,
        );
        info!(
            language = %profile.language_id,
            outcome = %result.outcome,
            duration_ms = result.duration_ms,
            "execution finished"
        );
        Ok(result)
    }
}

/// Compiles the source to `{binary}` in the run directory, then runs it.
/// A failed compile is reported as a completed execution in the compile phase.
pub struct CompiledWorker {
    config: Arc<ProcessConfig>,
}

impl CompiledWorker {
    pub fn new(config: Arc<ProcessConfig>) -> Self {
        Self { config }
    }
}

fn compile_limits(profile: &LanguageProfile) -> ResourceLimits {
    ResourceLimits {
        memory_mb: profile.limits.memory_mb.max(COMPILE_MEMORY_FLOOR_MB),
        cpu_ms: profile
            .limits
            .cpu_ms
            .max(profile.compile_timeout().as_millis() as u64),
        ..profile.limits.clone()
    }
}

#[async_trait]
impl ExecutionWorker for CompiledWorker {
    fn name(&self) -> &str {
        "compiled"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecutionResult> {
        let started = Instant::now();
        if request.cancel.is_cancelled() {
            return Ok(ExecutionResult::cancelled(started.elapsed()));
        }
        let profile = request.profile;
        let compile_command = profile.compile_command.as_ref().ok_or_else(|| {
            SandboxError::InvalidProfile(format!(
                "{}: compiled worker needs a compile command",
                profile.language_id
            ))
        })?;
        let cap = profile.limits.max_output_bytes;
        let run_dir = RunDir::create(&self.config, profile, request.source).await?;

        let argv = run_dir.render(compile_command);
        let limits = compile_limits(profile);
        let compiled = process::run(&Invocation {
            argv: &argv,
            jail: run_dir.jail(),
            limits: &limits,
            timeout: profile.compile_timeout(),
            search_path: &self.config.search_path,
            cancel: &request.cancel,
        })
        .await?;

        if !compiled.succeeded() {
            let result = compiled.into_result(Phase::Compile, started.elapsed(), cap);
            info!(
                language = %profile.language_id,
                outcome = %result.outcome,
                exit_code = ?result.exit_code,
                "compilation failed"
            );
            return Ok(result);
        }
        debug!(
            language = %profile.language_id,
            compile_ms = compiled.elapsed.as_millis() as u64,
            "compiled"
        );

        let argv = run_dir.render(&profile.run_command);
        let finished = process::run(&Invocation {
            argv: &argv,
            jail: run_dir.jail(),
            limits: &profile.limits,
            timeout: profile.limits.wall_clock(),
            search_path: &self.config.search_path,
            cancel: &request.cancel,
        })
        .await?;

        let result = finished.into_result(Phase::Run, started.elapsed(), cap);
        info!(
            language = %profile.language_id,
            outcome = %result.outcome,
            duration_ms = result.duration_ms,
            "execution finished"
        );
        Ok(result)
    }
}
