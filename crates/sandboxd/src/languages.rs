use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sandbox::{LanguageProfile, ResourceLimits};
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};

const DEFAULT_OUTPUT_BYTES: usize = 64 * 1024;

/// Static catalog from language id (or alias) to execution profile.
///
/// Built once at startup and then only read, so it is shared as a plain
/// `Arc<LanguageRegistry>` without locking.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, Arc<LanguageProfile>>,
    aliases: HashMap<String, String>,
}

fn limits(cpu_ms: u64, memory_mb: u64, wall_clock_ms: u64) -> ResourceLimits {
    ResourceLimits {
        cpu_ms,
        memory_mb,
        wall_clock_ms,
        max_output_bytes: DEFAULT_OUTPUT_BYTES,
    }
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn interpreted(
    id: &str,
    aliases: &[&str],
    ext: &str,
    run: &[&str],
    limits: ResourceLimits,
) -> LanguageProfile {
    LanguageProfile {
        language_id: id.into(),
        aliases: argv(aliases),
        file_extension: ext.into(),
        compile_command: None,
        run_command: argv(run),
        limits,
        compile_wall_clock_ms: None,
    }
}

fn compiled(
    id: &str,
    aliases: &[&str],
    ext: &str,
    compile: &[&str],
    compile_wall_clock_ms: u64,
    limits: ResourceLimits,
) -> LanguageProfile {
    LanguageProfile {
        language_id: id.into(),
        aliases: argv(aliases),
        file_extension: ext.into(),
        compile_command: Some(argv(compile)),
        run_command: argv(&["{binary}"]),
        limits,
        compile_wall_clock_ms: Some(compile_wall_clock_ms),
    }
}

/// Profiles shipped with the service.
pub fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        interpreted(
            "python",
            &["py", "python3"],
            ".py",
            &["python3", "-I", "-B", "{source}"],
            limits(5_000, 256, 10_000),
        ),
        // V8 reserves a large virtual address space up front; RLIMIT_AS
        // below ~2 GiB stops node before it runs anything.
        interpreted(
            "javascript",
            &["js", "node"],
            ".js",
            &["node", "{source}"],
            limits(5_000, 4_096, 10_000),
        ),
        interpreted(
            "bash",
            &["sh"],
            ".sh",
            &["bash", "{source}"],
            limits(5_000, 128, 10_000),
        ),
        interpreted(
            "ruby",
            &["rb"],
            ".rb",
            &["ruby", "{source}"],
            limits(5_000, 512, 10_000),
        ),
        compiled(
            "c",
            &[],
            ".c",
            &["cc", "-O2", "-std=c11", "-o", "{binary}", "{source}", "-lm"],
            15_000,
            limits(5_000, 256, 10_000),
        ),
        compiled(
            "cpp",
            &["c++"],
            ".cpp",
            &["c++", "-O2", "-std=c++17", "-o", "{binary}", "{source}"],
            30_000,
            limits(5_000, 256, 10_000),
        ),
        compiled(
            "rust",
            &["rs"],
            ".rs",
            &["rustc", "-O", "--edition", "2021", "-o", "{binary}", "{source}"],
            60_000,
            limits(5_000, 256, 10_000),
        ),
    ]
}

impl LanguageRegistry {
    /// Built-in profiles, then `overrides` replacing or adding by id.
    pub fn new(overrides: Vec<LanguageProfile>) -> ServiceResult<Self> {
        let mut registry = Self::default();
        for profile in builtin_profiles().into_iter().chain(overrides) {
            registry.register(profile)?;
        }
        Ok(registry)
    }

    /// Add a profile, replacing any existing one with the same id.
    pub fn register(&mut self, profile: LanguageProfile) -> ServiceResult<()> {
        profile
            .validate()
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        let id = profile.language_id.clone();
        if let Some(owner) = self.aliases.get(&id)
            && owner != &id
        {
            return Err(ServiceError::Config(format!(
                "language id {id} is already an alias of {owner}"
            )));
        }

        if let Some(previous) = self.profiles.remove(&id) {
            self.aliases.retain(|_, target| target != &previous.language_id);
        }
        self.aliases.insert(id.clone(), id.clone());
        for alias in &profile.aliases {
            if let Some(owner) = self.aliases.get(alias)
                && owner != &id
            {
                return Err(ServiceError::Config(format!(
                    "alias {alias} of {id} already belongs to {owner}"
                )));
            }
            self.aliases.insert(alias.clone(), id.clone());
        }
        self.profiles.insert(id, Arc::new(profile));
        Ok(())
    }

    /// Look up a profile by id or alias.
    pub fn resolve(&self, language: &str) -> ServiceResult<Arc<LanguageProfile>> {
        self.aliases
            .get(language)
            .and_then(|id| self.profiles.get(id))
            .cloned()
            .ok_or_else(|| ServiceError::UnsupportedLanguage(language.to_string()))
    }

    /// Profiles in id order.
    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Drop every profile whose interpreter or compiler is not installed.
    /// Returns the removed ids with the programs they were missing.
    pub fn retain_available(&mut self, search_path: &str) -> Vec<(String, Vec<String>)> {
        let missing: Vec<(String, Vec<String>)> = self
            .profiles
            .values()
            .filter_map(|profile| {
                let programs = sandbox_process::missing_programs(profile, search_path);
                (!programs.is_empty()).then(|| (profile.language_id.clone(), programs))
            })
            .collect();

        for (id, programs) in &missing {
            warn!(language = %id, missing = ?programs, "runtime not installed, language disabled");
            self.profiles.remove(id);
            self.aliases.retain(|_, target| target != id);
        }
        info!(languages = self.profiles.len(), "language catalog ready");
        missing
    }
}
