use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox_process::{ProcessConfig, ProcessFactory};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::audit::AuditHook;
use crate::config;
use crate::error::{ServiceError, ServiceResult};
use crate::languages::LanguageRegistry;
use crate::limiter::ExecutionLimiter;
use crate::orchestrator::{OrchestratorParts, Policy, SandboxOrchestrator};
use crate::reaper::ExpiryReaper;
use crate::registry::ContainerRegistry;
use crate::router::SubmissionRouter;
use crate::status::{ServiceMode, StatusTracker};
use crate::storage::ScratchStorage;

/// How long shutdown waits for cancelled executions to unwind.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Args)]
pub struct ServeArgs {
    /// Path to sandboxd.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Listen address (overrides config)
    #[arg(long, env = "SANDBOXD_LISTEN")]
    listen: Option<SocketAddr>,
    /// Base directory for scratch storage and status.json (overrides config)
    #[arg(long, env = "SANDBOXD_BASE_DIR")]
    base_dir: Option<PathBuf>,
    /// Permit running as root
    #[arg(long)]
    allow_root: bool,
}

/// Load config, wire the service, and serve until SIGINT/SIGTERM.
pub async fn run_serve(args: ServeArgs) -> ServiceResult<()> {
    if nix::unistd::getuid().is_root() && !args.allow_root {
        return Err(ServiceError::Config(
            "refusing to run as root (user code would run as root too); pass --allow-root to override"
                .into(),
        ));
    }

    let mut service_config = config::load(&args.config).await?;
    if let Some(listen) = args.listen {
        service_config.listen = listen;
    }
    if let Some(base_dir) = args.base_dir {
        service_config.base_dir = base_dir;
    }
    let base_dir = &service_config.base_dir;
    tokio::fs::create_dir_all(base_dir).await.map_err(|e| {
        ServiceError::Config(format!("create base_dir {}: {e}", base_dir.display()))
    })?;

    let storage = Arc::new(ScratchStorage::new(base_dir));
    storage.prepare().await.map_err(|e| {
        ServiceError::Config(format!(
            "create scratch dir {}: {e}",
            storage.sources_dir().display()
        ))
    })?;
    storage.sweep_orphans().await?;

    let process =
        ProcessConfig::new(storage.runs_dir().to_path_buf()).with_private_dir(base_dir.clone());
    let mut languages = LanguageRegistry::new(std::mem::take(&mut service_config.languages))?;
    languages.retain_available(&process.search_path);
    if languages.is_empty() {
        return Err(ServiceError::Config(
            "no language runtime is installed on this host".into(),
        ));
    }
    let factory = ProcessFactory::new(process).await?;

    let audit_stop = CancellationToken::new();
    let (audit, audit_task) = match &service_config.audit {
        Some(audit_config) => {
            let (hook, handle) = AuditHook::spawn(audit_config, audit_stop.clone())?;
            (hook, Some(handle))
        }
        None => (AuditHook::disabled(), None),
    };

    let limits = &service_config.sandbox;
    let registry = Arc::new(ContainerRegistry::new());
    let limiter = Arc::new(ExecutionLimiter::new(
        limits.max_concurrent,
        limits.max_queued,
    ));
    let orchestrator = SandboxOrchestrator::new(OrchestratorParts {
        registry: registry.clone(),
        languages: Arc::new(languages),
        factory: Arc::new(factory),
        storage,
        limiter: limiter.clone(),
        audit,
        policy: Policy::from_config(limits)?,
    });

    let status = Arc::new(StatusTracker::new(service_config.status_path()));
    status.write_initial().await;

    let reaper_stop = CancellationToken::new();
    let reaper = ExpiryReaper::new(
        orchestrator.reclaimer().clone(),
        registry,
        limiter,
        limits,
    )?
    .with_status(status.clone());
    let reaper_task = tokio::spawn(reaper.run(reaper_stop.clone()));

    let listener = tokio::net::TcpListener::bind(service_config.listen)
        .await
        .map_err(|e| ServiceError::Config(format!("bind {}: {e}", service_config.listen)))?;
    info!(
        listen = %service_config.listen,
        languages = orchestrator.languages().len(),
        max_concurrent = limits.max_concurrent,
        max_queued = limits.max_queued,
        "sandboxd started"
    );

    // Executions are cancelled as soon as draining starts, so in-flight
    // execute requests return promptly instead of holding up the server.
    let stopping = CancellationToken::new();
    let drain = {
        let orchestrator = orchestrator.clone();
        let stopping = stopping.clone();
        tokio::spawn(async move {
            stopping.cancelled().await;
            orchestrator.shutdown(SHUTDOWN_GRACE).await;
        })
    };

    let app = api::router(SubmissionRouter::new(orchestrator));
    let on_signal = {
        let status = status.clone();
        let stopping = stopping.clone();
        async move {
            wait_for_signal().await;
            status.set_mode(ServiceMode::Draining).await;
            stopping.cancel();
        }
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(on_signal)
        .await;
    if let Err(e) = &served {
        error!(error = %e, "http server failed");
        status.set_mode(ServiceMode::Draining).await;
    }

    reaper_stop.cancel();
    if let Err(e) = reaper_task.await {
        warn!(error = %e, "reaper task panicked");
    }
    stopping.cancel();
    if let Err(e) = drain.await {
        warn!(error = %e, "shutdown task panicked");
    }

    audit_stop.cancel();
    if let Some(handle) = audit_task
        && let Err(e) = handle.await
    {
        warn!(error = %e, "audit task panicked");
    }

    status.set_mode(ServiceMode::Stopped).await;
    info!("sandboxd stopped");
    served.map_err(ServiceError::Io)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, draining");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, draining");
        }
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
