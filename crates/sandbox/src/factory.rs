use std::sync::Arc;

use crate::config::LanguageProfile;
use crate::worker::ExecutionWorker;

/// Selects the execution strategy for a language profile.
pub trait WorkerFactory: Send + Sync {
    /// Human-readable name for this backend (e.g. "process").
    fn name(&self) -> &str;
    /// Worker able to run code described by `profile`.
    fn worker_for(&self, profile: &LanguageProfile) -> Arc<dyn ExecutionWorker>;
}
