use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, ExecutionResult};

/// Runs one piece of source code to completion inside a disposable context.
///
/// Implementations own every process and temporary artifact they create for
/// the call and must release all of them before returning, whatever the
/// outcome. User-code failures (timeouts, crashes, limit hits, cancellation)
/// are reported through [`ExecutionResult::outcome`]; `Err` is reserved for
/// platform faults such as a missing runtime or an unwritable scratch dir.
#[async_trait]
pub trait ExecutionWorker: Send + Sync {
    /// Short strategy name for logs (e.g. "interpreted").
    fn name(&self) -> &str;

    async fn run(&self, request: &ExecRequest<'_>) -> Result<ExecutionResult>;
}
