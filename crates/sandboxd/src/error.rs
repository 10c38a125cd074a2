#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox {0} already has an execution in flight")]
    Busy(String),

    #[error("sandbox expired: {0}")]
    Expired(String),

    #[error("execution pool saturated, retry later")]
    Overloaded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Name in the external error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "UnsupportedLanguage",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::NotFound(_) => "SandboxNotFound",
            // Saturation is a retry-later busy signal for callers.
            Self::Busy(_) | Self::Overloaded => "SandboxBusy",
            Self::Expired(_) => "SandboxExpired",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Internal(_) | Self::Sandbox(_) | Self::Config(_) | Self::Io(_) => {
                "InternalOrchestrationError"
            }
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
