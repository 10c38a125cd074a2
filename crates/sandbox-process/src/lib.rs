mod capture;
mod config;
mod factory;
mod jail;
mod paths;
mod prerequisites;
mod process;
mod worker;

pub use config::ProcessConfig;
pub use factory::ProcessFactory;
pub use prerequisites::{check_prerequisites, missing_programs};
pub use worker::{CompiledWorker, InterpretedWorker};
