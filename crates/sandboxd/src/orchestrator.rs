use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use sandbox::{ExecRequest, ExecutionResult, LanguageProfile, WorkerFactory};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditHook};
use crate::config::SandboxConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::languages::LanguageRegistry;
use crate::limiter::{Admission, ExecutionLimiter};
use crate::reaper::{Reclaimer, Reclamation};
use crate::registry::ContainerRegistry;
use crate::storage::ScratchStorage;
use crate::types::{SandboxRecord, SandboxState, SandboxStatus, SandboxSummary};

/// Lifecycle policy derived from [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct Policy {
    pub default_ttl: TimeDelta,
    pub max_lifetime: TimeDelta,
    pub max_source_bytes: usize,
    pub run_on_submit: bool,
}

pub(crate) fn seconds(secs: u64, field: &str) -> ServiceResult<TimeDelta> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ServiceError::Config(format!("sandbox.{field} is out of range")))
}

impl Policy {
    pub fn from_config(config: &SandboxConfig) -> ServiceResult<Self> {
        config.validate()?;
        Ok(Self {
            default_ttl: seconds(config.default_ttl_secs, "default_ttl_secs")?,
            max_lifetime: seconds(config.max_lifetime_secs, "max_lifetime_secs")?,
            max_source_bytes: config.max_source_bytes,
            run_on_submit: config.run_on_submit,
        })
    }
}

/// Collaborators the orchestrator is wired with at startup.
pub struct OrchestratorParts {
    pub registry: Arc<ContainerRegistry>,
    pub languages: Arc<LanguageRegistry>,
    pub factory: Arc<dyn WorkerFactory>,
    pub storage: Arc<ScratchStorage>,
    pub limiter: Arc<ExecutionLimiter>,
    pub audit: AuditHook,
    pub policy: Policy,
}

/// Owns every sandbox state transition except reclamation, which it shares
/// with the reaper through [`Reclaimer`].
///
/// Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct SandboxOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ContainerRegistry>,
    languages: Arc<LanguageRegistry>,
    factory: Arc<dyn WorkerFactory>,
    storage: Arc<ScratchStorage>,
    limiter: Arc<ExecutionLimiter>,
    reclaimer: Reclaimer,
    audit: AuditHook,
    policy: Policy,
    tasks: TaskTracker,
}

impl SandboxOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let reclaimer = Reclaimer::new(
            parts.registry.clone(),
            parts.storage.clone(),
            parts.audit.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                languages: parts.languages,
                factory: parts.factory,
                storage: parts.storage,
                limiter: parts.limiter,
                reclaimer,
                audit: parts.audit,
                policy: parts.policy,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.inner.registry
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.inner.languages
    }

    pub fn policy(&self) -> &Policy {
        &self.inner.policy
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.inner.reclaimer
    }

    /// Store `code` in a new sandbox, ready to execute.
    pub async fn create(&self, language: &str, code: &str) -> ServiceResult<SandboxRecord> {
        let profile = self.inner.languages.resolve(language)?;
        let limit = self.inner.policy.max_source_bytes;
        if code.len() > limit {
            return Err(ServiceError::PayloadTooLarge {
                size: code.len(),
                limit,
            });
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let expires_at = created_at
            .checked_add_signed(self.inner.policy.default_ttl)
            .ok_or_else(|| ServiceError::Internal("expiry out of range".into()))?;
        let source_path = self.inner.storage.source_path(id, &profile);
        let registry = &self.inner.registry;
        registry.insert(SandboxRecord::new(
            id,
            profile.language_id.clone(),
            source_path.clone(),
            created_at,
            expires_at,
        ))?;

        if let Err(e) = self.inner.storage.write(&source_path, code).await {
            let message = format!("store source: {e}");
            error!(id = %id, error = %e, "failed to store source");
            let _ = registry.transition(id, |r| {
                if r.state == SandboxState::Provisioning {
                    r.state = SandboxState::Failed;
                    r.failure = Some(message.clone());
                }
                Ok(())
            });
            return Err(ServiceError::Internal(message));
        }

        self.publish(id, code.len()).await
    }

    /// Mark a freshly stored sandbox `Ready`. One terminated while its
    /// source was being written is reclaimed instead and reported expired.
    async fn publish(&self, id: Uuid, source_bytes: usize) -> ServiceResult<SandboxRecord> {
        let record = self.inner.registry.transition(id, |r| {
            if r.state == SandboxState::Provisioning {
                r.state = SandboxState::Ready;
            }
            Ok(r.clone())
        })?;
        info!(
            id = %id,
            language = %record.language,
            bytes = source_bytes,
            "sandbox created"
        );
        self.inner.audit.record(AuditEvent::Submitted {
            id,
            language: record.language.clone(),
            source_bytes,
        });

        if record.retiring {
            let reclaimed = self.inner.reclaimer.reclaim(id, false).await?;
            info!(id = %id, reclaimed = ?reclaimed, "sandbox terminated during creation");
            return Err(ServiceError::Expired(id.to_string()));
        }
        if self.inner.policy.run_on_submit
            && let Err(e) = self.start(id)
        {
            warn!(id = %id, error = %e, "run on submit not started");
        }
        Ok(record)
    }

    /// Run the sandbox's code and wait for the result.
    ///
    /// The execution itself runs on its own task, so dropping this future
    /// (a disconnected caller) does not stop it; the worker's wall-clock
    /// limit still bounds it.
    pub async fn execute(&self, id: Uuid) -> ServiceResult<ExecutionResult> {
        let handle = self.start(id)?;
        handle
            .await
            .map_err(|e| ServiceError::Internal(format!("execution task: {e}")))?
    }

    /// Begin an execution and return without waiting for it.
    pub fn start(&self, id: Uuid) -> ServiceResult<JoinHandle<ServiceResult<ExecutionResult>>> {
        if self.inner.tasks.is_closed() {
            return Err(ServiceError::Internal("service is shutting down".into()));
        }
        let record = self.lookup(id)?;
        let profile = self.inner.languages.resolve(&record.language)?;
        let now = Utc::now();
        let cancel = CancellationToken::new();
        let limiter = &self.inner.limiter;

        let (admission, source) = self.inner.registry.transition(id, |r| {
            match r.state {
                SandboxState::Ready | SandboxState::Idle => {}
                SandboxState::Running | SandboxState::Provisioning => {
                    return Err(ServiceError::Busy(id.to_string()));
                }
                SandboxState::Expired => return Err(ServiceError::Expired(id.to_string())),
                SandboxState::Reclaimed => return Err(ServiceError::NotFound(id.to_string())),
                SandboxState::Failed => {
                    return Err(ServiceError::Internal(format!(
                        "sandbox {id} failed: {}",
                        r.failure.as_deref().unwrap_or("unknown fault")
                    )));
                }
            }
            if r.retiring || r.is_expired_at(now) {
                return Err(ServiceError::Expired(id.to_string()));
            }
            let admission = limiter.admit()?;
            r.state = SandboxState::Running;
            r.cancel = Some(cancel.clone());
            Ok((admission, r.source_path.clone()))
        })?;
        debug!(id = %id, queued = limiter.queued(), "execution admitted");

        let this = self.clone();
        Ok(self
            .inner
            .tasks
            .spawn(this.run_execution(id, profile, source, cancel, admission)))
    }

    async fn run_execution(
        self,
        id: Uuid,
        profile: Arc<LanguageProfile>,
        source: PathBuf,
        cancel: CancellationToken,
        admission: Admission,
    ) -> ServiceResult<ExecutionResult> {
        let mut guard = InFlight {
            registry: self.inner.registry.clone(),
            id,
            settled: false,
        };
        let started = Instant::now();

        let slot = tokio::select! {
            slot = admission.slot() => Some(slot),
            _ = cancel.cancelled() => None,
        };
        let outcome = match slot {
            None => Ok(ExecutionResult::cancelled(started.elapsed())),
            Some(Err(e)) => Err(e),
            Some(Ok(_permit)) => {
                let worker = self.inner.factory.worker_for(&profile);
                debug!(id = %id, worker = worker.name(), "execution started");
                worker
                    .run(&ExecRequest {
                        profile: &profile,
                        source: &source,
                        cancel: cancel.clone(),
                    })
                    .await
                    .map_err(ServiceError::from)
            }
        };
        drop(admission);

        guard.settled = true;
        self.finish(id, &profile, outcome).await
    }

    /// Store the outcome and leave `Running`. No await happens before the
    /// state is written.
    async fn finish(
        &self,
        id: Uuid,
        profile: &LanguageProfile,
        outcome: ServiceResult<ExecutionResult>,
    ) -> ServiceResult<ExecutionResult> {
        let retiring = self.inner.registry.transition(id, |r| {
            r.cancel = None;
            match &outcome {
                Ok(result) => {
                    r.last_result = Some(result.clone());
                    if r.state == SandboxState::Running {
                        r.state = SandboxState::Idle;
                    }
                }
                Err(e) => {
                    if r.state == SandboxState::Running {
                        r.state = SandboxState::Failed;
                        r.failure = Some(e.to_string());
                    }
                }
            }
            Ok(r.retiring)
        });

        match &outcome {
            Ok(result) => {
                info!(
                    id = %id,
                    language = %profile.language_id,
                    outcome = %result.outcome,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration_ms,
                    truncated = result.truncated,
                    "execution finished"
                );
                self.inner
                    .audit
                    .record(AuditEvent::executed(id, &profile.language_id, result));
            }
            Err(e) => error!(id = %id, error = %e, "execution failed"),
        }

        match retiring {
            Ok(true) => {
                if let Err(e) = self.inner.reclaimer.reclaim(id, false).await {
                    warn!(id = %id, error = %e, "failed to reclaim terminated sandbox");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(id = %id, error = %e, "failed to record execution result"),
        }
        outcome
    }

    /// Extend the time-to-live. The new expiry is `now + ttl`, capped at
    /// `created_at + max_lifetime`, and never earlier than the current one.
    pub fn extend(&self, id: Uuid, ttl_secs: u64) -> ServiceResult<DateTime<Utc>> {
        let max_lifetime = self.inner.policy.max_lifetime;
        let ttl = i64::try_from(ttl_secs)
            .unwrap_or(i64::MAX)
            .min(max_lifetime.num_seconds());
        let ttl = TimeDelta::try_seconds(ttl)
            .ok_or_else(|| ServiceError::InvalidRequest(format!("ttl out of range: {ttl_secs}")))?;
        let now = Utc::now();

        let expires_at = self.inner.registry.transition(id, |r| {
            match r.state {
                SandboxState::Reclaimed => return Err(ServiceError::NotFound(id.to_string())),
                SandboxState::Expired => return Err(ServiceError::Expired(id.to_string())),
                _ => {}
            }
            if r.retiring || r.is_expired_at(now) {
                return Err(ServiceError::Expired(id.to_string()));
            }
            let requested = now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let cap = r
                .created_at
                .checked_add_signed(max_lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            r.expires_at = requested.min(cap).max(r.expires_at);
            r.extension_count = r.extension_count.saturating_add(1);
            Ok(r.expires_at)
        })?;
        debug!(id = %id, expires_at = %expires_at, "sandbox extended");
        Ok(expires_at)
    }

    /// All sandboxes not yet reclaimed, oldest first.
    pub fn list(&self) -> ServiceResult<Vec<SandboxSummary>> {
        let mut summaries: Vec<SandboxSummary> = self
            .inner
            .registry
            .snapshot()?
            .iter()
            .filter(|r| r.state != SandboxState::Reclaimed)
            .map(SandboxRecord::summary)
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }

    pub fn status(&self, id: Uuid) -> ServiceResult<SandboxStatus> {
        Ok(self.lookup(id)?.status())
    }

    /// Cancel any in-flight execution and retire the sandbox. An idle
    /// sandbox is reclaimed now; a running one once its execution unwinds.
    /// Returns the state the sandbox is left in.
    pub async fn terminate(&self, id: Uuid) -> ServiceResult<SandboxState> {
        let reclaim_now = self.inner.registry.transition(id, |r| match r.state {
            SandboxState::Reclaimed => Err(ServiceError::NotFound(id.to_string())),
            SandboxState::Running | SandboxState::Provisioning => {
                r.retiring = true;
                if let Some(cancel) = &r.cancel {
                    cancel.cancel();
                }
                Ok(false)
            }
            _ => {
                r.retiring = true;
                Ok(true)
            }
        })?;
        info!(id = %id, "sandbox terminated");

        if reclaim_now {
            return Ok(match self.inner.reclaimer.reclaim(id, false).await? {
                Reclamation::Reclaimed { .. } | Reclamation::AlreadyReclaimed => {
                    SandboxState::Reclaimed
                }
                // The reaper retries the deletion.
                _ => SandboxState::Expired,
            });
        }
        Ok(SandboxState::Running)
    }

    /// Stop accepting executions, cancel the running ones, wait up to
    /// `grace` for them to unwind, then reclaim every sandbox.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.tasks.close();

        let records = match self.inner.registry.snapshot() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "cannot enumerate sandboxes for shutdown");
                return;
            }
        };
        let mut cancelled = 0;
        for record in &records {
            if let Some(cancel) = &record.cancel {
                cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled in-flight executions");
        }
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tasks.len(),
                "executions still unwinding after grace period"
            );
        }

        let mut reclaimed = 0;
        for record in records
            .iter()
            .filter(|r| r.state != SandboxState::Reclaimed)
        {
            match self.inner.reclaimer.reclaim(record.id, true).await {
                Ok(Reclamation::Reclaimed { .. }) => reclaimed += 1,
                Ok(_) => {}
                Err(e) => warn!(id = %record.id, error = %e, "failed to reclaim at shutdown"),
            }
        }
        info!(reclaimed, "sandboxes reclaimed at shutdown");
    }

    /// Current record, treating reclaimed ones as absent.
    fn lookup(&self, id: Uuid) -> ServiceResult<SandboxRecord> {
        self.inner
            .registry
            .get(id)?
            .filter(|r| r.state != SandboxState::Reclaimed)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }
}

/// Marks the sandbox `Failed` if an execution task is dropped or panics
/// before its outcome is recorded.
struct InFlight {
    registry: Arc<ContainerRegistry>,
    id: Uuid,
    settled: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        error!(id = %self.id, "execution aborted before completion");
        let _ = self.registry.transition(self.id, |r| {
            r.cancel = None;
            if r.state == SandboxState::Running {
                r.state = SandboxState::Failed;
                r.failure = Some("execution aborted".into());
            }
            Ok(())
        });
    }
}
