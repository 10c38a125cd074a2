mod init;
mod languages;
mod run;
mod serve;

pub use init::{InitArgs, run_init};
pub use languages::{LanguagesArgs, run_languages};
pub use run::{RunArgs, run_file};
pub use serve::{ServeArgs, run_serve};

use std::path::Path;

use sandbox::LanguageProfile;

use crate::config;
use crate::error::ServiceResult;

/// Language overrides from an optional config file.
async fn language_overrides(path: Option<&Path>) -> ServiceResult<Vec<LanguageProfile>> {
    match path {
        Some(path) => Ok(config::load(path).await?.languages),
        None => Ok(Vec::new()),
    }
}
