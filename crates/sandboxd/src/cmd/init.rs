use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::config::{self, CONFIG_FILE_NAME, ServiceConfig};
use crate::error::{ServiceError, ServiceResult};

#[derive(Args)]
pub struct InitArgs {
    /// Base directory for scratch storage, status.json and the new sandboxd.yaml
    #[arg(long, env = "SANDBOXD_BASE_DIR")]
    base_dir: PathBuf,
    /// Listen address to record in the config
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Overwrite an existing sandboxd.yaml
    #[arg(long)]
    force: bool,
}

/// Write a default `sandboxd.yaml` into the base directory and print its path.
pub async fn run_init(args: InitArgs) -> ServiceResult<()> {
    // Stored absolute: `load` resolves relative paths against the file's own directory.
    let base_dir = std::path::absolute(&args.base_dir).map_err(|e| {
        ServiceError::Config(format!("resolve {}: {e}", args.base_dir.display()))
    })?;
    let existing = base_dir.join(CONFIG_FILE_NAME);
    let exists = tokio::fs::try_exists(&existing)
        .await
        .map_err(|e| ServiceError::Config(format!("check {}: {e}", existing.display())))?;
    if exists && !args.force {
        return Err(ServiceError::Config(format!(
            "{} already exists; pass --force to overwrite",
            existing.display()
        )));
    }

    let mut service_config = ServiceConfig::with_base_dir(base_dir);
    if let Some(listen) = args.listen {
        service_config.listen = listen;
    }
    let path = config::generate(&service_config).await?;
    info!(path = %path.display(), "config written");
    println!("{}", path.display());
    Ok(())
}
