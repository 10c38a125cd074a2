pub mod api;
pub mod audit;
pub mod cmd;
pub mod config;
pub mod error;
pub mod languages;
pub mod limiter;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod status;
pub mod storage;
pub mod types;

pub use error::{ServiceError, ServiceResult};
pub use orchestrator::SandboxOrchestrator;
pub use router::SubmissionRouter;
