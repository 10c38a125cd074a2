use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use sandbox::{ExecRequest, Outcome, WorkerFactory};
use sandbox_process::{ProcessConfig, ProcessFactory};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::languages::LanguageRegistry;

#[derive(Args)]
pub struct RunArgs {
    /// Language id or alias
    #[arg(long, short)]
    language: String,
    /// Source file to execute
    file: PathBuf,
    /// Path to sandboxd.yaml for language overrides
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Wall-clock limit in milliseconds (overrides the profile)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

/// Execute one file through the worker and print the JSON result.
///
/// Exits non-zero unless the program completed with status 0.
pub async fn run_file(args: RunArgs) -> ServiceResult<ExitCode> {
    let overrides = super::language_overrides(args.config.as_deref()).await?;
    let registry = LanguageRegistry::new(overrides)?;
    let mut profile = registry
        .resolve(&args.language.trim().to_ascii_lowercase())?
        .as_ref()
        .clone();
    if let Some(ms) = args.timeout_ms {
        profile.limits.wall_clock_ms = ms;
    }

    let scratch = tempfile::tempdir()?;
    let factory = ProcessFactory::new(ProcessConfig::new(scratch.path().join("runs"))).await?;
    let worker = factory.worker_for(&profile);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, cancelling");
            on_interrupt.cancel();
        }
    });

    let result = worker
        .run(&ExecRequest {
            profile: &profile,
            source: &args.file,
            cancel,
        })
        .await?;
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| ServiceError::Internal(format!("serialize result: {e}")))?;
    println!("{json}");

    let succeeded = result.outcome == Outcome::Completed && result.exit_code == Some(0);
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
