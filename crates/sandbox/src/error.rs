#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("invalid language profile: {0}")]
    InvalidProfile(String),

    #[error("process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
