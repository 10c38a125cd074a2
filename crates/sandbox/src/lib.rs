mod config;
mod error;
mod factory;
mod types;
mod worker;

pub use config::{
    BINARY_PLACEHOLDER, DIR_PLACEHOLDER, LanguageProfile, ResourceLimits, RuntimeKind,
    SOURCE_PLACEHOLDER,
};
pub use error::{Result, SandboxError};
pub use factory::WorkerFactory;
pub use types::{ExecRequest, ExecutionResult, Outcome, Phase};
pub use worker::ExecutionWorker;
