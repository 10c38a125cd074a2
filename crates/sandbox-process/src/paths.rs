use std::path::{Path, PathBuf};

use sandbox::{LanguageProfile, SandboxError};
use tempfile::TempDir;

use crate::config::ProcessConfig;
use crate::jail::{Jail, WORKDIR};

/// Name of the compiled artifact inside a run directory.
const BINARY_NAME: &str = "main";
/// Holds the program's files; appears as [`WORKDIR`] inside the jail.
const WORK_DIR: &str = "work";
/// Mount point for the jail's root filesystem.
const ROOT_DIR: &str = "root";

/// Private working directory for a single execution, plus the jail that
/// confines the processes run in it.
///
/// Removed recursively when dropped, so every exit path of a worker call
/// (completion, timeout, crash, cancellation, early `?`) releases it.
pub(crate) struct RunDir {
    dir: TempDir,
    entry_file: String,
    jail: Jail,
}

impl RunDir {
    /// Create a run directory under the configured run root and copy
    /// `source` into it.
    pub async fn create(
        config: &ProcessConfig,
        profile: &LanguageProfile,
        source: &Path,
    ) -> sandbox::Result<Self> {
        let run_dir = Self::empty(config, profile.entry_file())?;
        tokio::fs::copy(source, run_dir.work().join(&run_dir.entry_file))
            .await
            .map_err(|e| {
                SandboxError::ExecFailed(format!("materialize {}: {e}", source.display()))
            })?;
        Ok(run_dir)
    }

    /// Create a run directory with nothing in it yet.
    pub fn empty(config: &ProcessConfig, entry_file: String) -> sandbox::Result<Self> {
        let root = &config.run_root;
        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(root)
            .map_err(|e| {
                SandboxError::ExecFailed(format!("create run dir in {}: {e}", root.display()))
            })?;
        let work = dir.path().join(WORK_DIR);
        let jail_root = dir.path().join(ROOT_DIR);
        for path in [&work, &jail_root] {
            std::fs::create_dir(path).map_err(|e| {
                SandboxError::ExecFailed(format!("create {}: {e}", path.display()))
            })?;
        }
        let jail = Jail::new(&jail_root, &work, &config.mirrored_dirs())
            .map_err(|e| SandboxError::ExecFailed(format!("prepare jail: {e}")))?;
        Ok(Self {
            dir,
            entry_file,
            jail,
        })
    }

    pub fn jail(&self) -> &Jail {
        &self.jail
    }

    /// Host side of [`WORKDIR`].
    pub fn work(&self) -> PathBuf {
        self.dir.path().join(WORK_DIR)
    }

    /// Substitute `{source}`, `{binary}` and `{dir}` in a command template
    /// with the paths the jailed process sees.
    pub fn render(&self, template: &[String]) -> Vec<String> {
        let source = format!("{WORKDIR}/{}", self.entry_file);
        let binary = format!("{WORKDIR}/{BINARY_NAME}");
        template
            .iter()
            .map(|arg| {
                arg.replace(sandbox::SOURCE_PLACEHOLDER, &source)
                    .replace(sandbox::BINARY_PLACEHOLDER, &binary)
                    .replace(sandbox::DIR_PLACEHOLDER, WORKDIR)
            })
            .collect()
    }
}
