use std::sync::Arc;

use sandbox::{ExecutionWorker, LanguageProfile, RuntimeKind, SandboxError, WorkerFactory};
use tracing::info;

use crate::config::ProcessConfig;
use crate::prerequisites::check_prerequisites;
use crate::worker::{CompiledWorker, InterpretedWorker};

/// Hands out one shared worker per runtime kind. Workers are stateless, so
/// a single instance serves every sandbox concurrently.
pub struct ProcessFactory {
    interpreted: Arc<InterpretedWorker>,
    compiled: Arc<CompiledWorker>,
}

impl ProcessFactory {
    /// Check host prerequisites and build the workers.
    pub async fn new(config: ProcessConfig) -> Result<Self, SandboxError> {
        check_prerequisites(&config).await?;
        info!(run_root = %config.run_root.display(), "process backend ready");

        let config = Arc::new(config);
        Ok(Self {
            interpreted: Arc::new(InterpretedWorker::new(config.clone())),
            compiled: Arc::new(CompiledWorker::new(config)),
        })
    }
}

impl WorkerFactory for ProcessFactory {
    fn name(&self) -> &str {
        "process"
    }

    fn worker_for(&self, profile: &LanguageProfile) -> Arc<dyn ExecutionWorker> {
        match profile.kind() {
            RuntimeKind::Interpreted => self.interpreted.clone(),
            RuntimeKind::Compiled => self.compiled.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sandbox::ResourceLimits;

    use super::*;

    #[tokio::test]
    async fn picks_worker_by_runtime_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = ProcessFactory::new(ProcessConfig::new(tmp.path().join("runs")))
            .await
            .unwrap();

        let mut profile = LanguageProfile {
            language_id: "c".into(),
            aliases: vec![],
            file_extension: ".c".into(),
            compile_command: None,
            run_command: vec!["{binary}".into()],
            limits: ResourceLimits {
                cpu_ms: 1000,
                memory_mb: 64,
                wall_clock_ms: 1000,
                max_output_bytes: 64,
            },
            compile_wall_clock_ms: None,
        };
        assert_eq!(factory.worker_for(&profile).name(), "interpreted");

        profile.compile_command = Some(vec!["cc".into(), "-o".into(), "{binary}".into()]);
        assert_eq!(factory.worker_for(&profile).name(), "compiled");
    }
}
