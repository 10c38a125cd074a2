use std::path::PathBuf;

use clap::Args;
use sandbox::RuntimeKind;
use sandbox_process::{ProcessConfig, missing_programs};

use crate::error::ServiceResult;
use crate::languages::LanguageRegistry;

#[derive(Args)]
pub struct LanguagesArgs {
    /// Path to sandboxd.yaml (built-in catalog only if omitted)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Print every registered profile and whether its runtime is installed.
pub async fn run_languages(args: LanguagesArgs) -> ServiceResult<()> {
    let overrides = super::language_overrides(args.config.as_deref()).await?;
    let registry = LanguageRegistry::new(overrides)?;
    let search_path = ProcessConfig::new(PathBuf::new()).search_path;

    println!(
        "{:<12} {:<12} {:<18} {:>7} {:>7} {:>8}  STATUS",
        "LANGUAGE", "KIND", "ALIASES", "CPU_MS", "MEM_MB", "WALL_MS"
    );
    for profile in registry.profiles() {
        let kind = match profile.kind() {
            RuntimeKind::Interpreted => "interpreted",
            RuntimeKind::Compiled => "compiled",
        };
        let missing = missing_programs(profile, &search_path);
        let status = if missing.is_empty() {
            "available".to_string()
        } else {
            format!("missing {}", missing.join(", "))
        };
        println!(
            "{:<12} {:<12} {:<18} {:>7} {:>7} {:>8}  {status}",
            profile.language_id,
            kind,
            profile.aliases.join(","),
            profile.limits.cpu_ms,
            profile.limits.memory_mb,
            profile.limits.wall_clock_ms,
        );
    }
    Ok(())
}
