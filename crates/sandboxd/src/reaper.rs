use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditHook};
use crate::config::SandboxConfig;
use crate::error::ServiceResult;
use crate::limiter::ExecutionLimiter;
use crate::orchestrator::seconds;
use crate::registry::ContainerRegistry;
use crate::status::{Occupancy, StatusTracker};
use crate::storage::ScratchStorage;
use crate::types::SandboxState;

/// What a reclamation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclamation {
    Reclaimed { forced: bool, newly_expired: bool },
    /// An execution is in flight and the attempt was not forced.
    Deferred,
    /// Another reclaimer holds the deletion.
    InProgress,
    AlreadyReclaimed,
    /// Storage could not be deleted; the sandbox stays `Expired`.
    DeletionFailed { newly_expired: bool },
}

enum Claim {
    Skip(Reclamation),
    Delete {
        path: PathBuf,
        forced: bool,
        newly_expired: bool,
    },
}

/// Moves sandboxes to `Expired` and then `Reclaimed`, deleting their stored
/// source exactly once. Shared by `terminate`, the reaper and shutdown.
#[derive(Clone)]
pub struct Reclaimer {
    registry: Arc<ContainerRegistry>,
    storage: Arc<ScratchStorage>,
    audit: AuditHook,
}

impl Reclaimer {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        storage: Arc<ScratchStorage>,
        audit: AuditHook,
    ) -> Self {
        Self {
            registry,
            storage,
            audit,
        }
    }

    /// Reclaim one sandbox. `force` also takes sandboxes with an execution
    /// in flight, cancelling it first.
    pub async fn reclaim(&self, id: Uuid, force: bool) -> ServiceResult<Reclamation> {
        let claim = self.registry.transition(id, |r| {
            let busy = matches!(r.state, SandboxState::Running | SandboxState::Provisioning);
            if r.state == SandboxState::Reclaimed {
                return Ok(Claim::Skip(Reclamation::AlreadyReclaimed));
            }
            if busy && !force {
                return Ok(Claim::Skip(Reclamation::Deferred));
            }
            if r.deleting {
                return Ok(Claim::Skip(Reclamation::InProgress));
            }
            if busy && let Some(cancel) = &r.cancel {
                cancel.cancel();
            }
            let newly_expired = r.state != SandboxState::Expired;
            r.state = SandboxState::Expired;
            r.deleting = true;
            Ok(Claim::Delete {
                path: r.source_path.clone(),
                forced: busy,
                newly_expired,
            })
        })?;

        let (path, forced, newly_expired) = match claim {
            Claim::Skip(skipped) => return Ok(skipped),
            Claim::Delete {
                path,
                forced,
                newly_expired,
            } => (path, forced, newly_expired),
        };

        if let Err(e) = self.storage.remove(&path).await {
            self.registry.transition(id, |r| {
                r.deleting = false;
                Ok(())
            })?;
            warn!(id = %id, path = %path.display(), error = %e, "failed to delete sandbox storage, will retry");
            return Ok(Reclamation::DeletionFailed { newly_expired });
        }

        let now = Utc::now();
        self.registry.transition(id, |r| {
            r.deleting = false;
            r.state = SandboxState::Reclaimed;
            r.reclaimed_at = Some(now);
            Ok(())
        })?;
        self.audit.record(AuditEvent::Reclaimed { id, forced });
        if forced {
            warn!(id = %id, "forcibly reclaimed sandbox past its maximum lifetime");
        } else {
            info!(id = %id, "sandbox reclaimed");
        }
        Ok(Reclamation::Reclaimed {
            forced,
            newly_expired,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reclaimed: usize,
    pub deferred: usize,
    pub forced: usize,
    pub failed_deletions: usize,
    pub purged: usize,
}

/// Periodically reclaims sandboxes whose time-to-live has passed.
pub struct ExpiryReaper {
    reclaimer: Reclaimer,
    registry: Arc<ContainerRegistry>,
    limiter: Arc<ExecutionLimiter>,
    max_lifetime: TimeDelta,
    retention: TimeDelta,
    interval: Duration,
    status: Option<Arc<StatusTracker>>,
}

impl ExpiryReaper {
    pub fn new(
        reclaimer: Reclaimer,
        registry: Arc<ContainerRegistry>,
        limiter: Arc<ExecutionLimiter>,
        config: &SandboxConfig,
    ) -> ServiceResult<Self> {
        Ok(Self {
            reclaimer,
            registry,
            limiter,
            max_lifetime: seconds(config.max_lifetime_secs, "max_lifetime_secs")?,
            retention: seconds(config.reclaimed_retention_secs, "reclaimed_retention_secs")?,
            interval: Duration::from_secs(config.reaper_interval_secs.max(1)),
            status: None,
        })
    }

    /// Publish occupancy to `status` after every sweep.
    pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    /// One pass over the registry as of `now`.
    ///
    /// Expired sandboxes with nothing in flight are reclaimed; running ones
    /// wait for their execution unless they are past the maximum lifetime,
    /// in which case the execution is cancelled and the sandbox reclaimed
    /// anyway. Reclaimed records older than the retention are dropped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> ServiceResult<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.registry.snapshot()? {
            if record.state == SandboxState::Reclaimed {
                let stale = record
                    .reclaimed_at
                    .is_some_and(|at| now.signed_duration_since(at) >= self.retention);
                if stale && self.registry.remove(record.id)? {
                    report.purged += 1;
                }
                continue;
            }

            let running = matches!(
                record.state,
                SandboxState::Running | SandboxState::Provisioning
            );
            let due = record.is_expired_at(now)
                || record.state == SandboxState::Expired
                || (record.retiring && !running);
            if !due {
                continue;
            }
            let force = running && now.signed_duration_since(record.created_at) > self.max_lifetime;

            match self.reclaimer.reclaim(record.id, force).await {
                Ok(Reclamation::Reclaimed {
                    forced,
                    newly_expired,
                }) => {
                    report.reclaimed += 1;
                    report.forced += usize::from(forced);
                    report.expired += usize::from(newly_expired);
                }
                Ok(Reclamation::Deferred) => {
                    debug!(id = %record.id, "expired sandbox still running, deferring");
                    report.deferred += 1;
                }
                Ok(Reclamation::DeletionFailed { newly_expired }) => {
                    report.failed_deletions += 1;
                    report.expired += usize::from(newly_expired);
                }
                Ok(Reclamation::InProgress | Reclamation::AlreadyReclaimed) => {}
                // Purged or removed concurrently.
                Err(e) => debug!(id = %record.id, error = %e, "skipping sandbox"),
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                reclaimed = report.reclaimed,
                deferred = report.deferred,
                forced = report.forced,
                failed_deletions = report.failed_deletions,
                purged = report.purged,
                "reaper sweep"
            );
        }
        Ok(report)
    }

    pub fn occupancy(&self) -> ServiceResult<Occupancy> {
        let active = self
            .registry
            .snapshot()?
            .iter()
            .filter(|r| r.state != SandboxState::Reclaimed)
            .count();
        Ok(Occupancy {
            active_sandboxes: active,
            running_executions: self.limiter.running(),
            queued_executions: self.limiter.queued(),
        })
    }

    /// Sweep every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "expiry reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                warn!(error = %e, "reaper sweep failed");
            }
            if let Some(status) = &self.status {
                match self.occupancy() {
                    Ok(occupancy) => status.set_occupancy(occupancy).await,
                    Err(e) => warn!(error = %e, "cannot compute occupancy"),
                }
            }
        }
        info!("expiry reaper stopped");
    }
}
