use std::path::{Path, PathBuf};

use crate::jail;

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Parent directory for per-execution run directories.
    pub run_root: PathBuf,
    /// `PATH` handed to user processes (the environment is otherwise cleared).
    pub search_path: String,
    /// Host directories that must never be mirrored into a jail, on top of
    /// `run_root`.
    pub private_dirs: Vec<PathBuf>,
}

impl ProcessConfig {
    /// Use the daemon's own `PATH` for user processes.
    pub fn new(run_root: PathBuf) -> Self {
        let search_path =
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
        Self {
            run_root,
            search_path,
            private_dirs: Vec::new(),
        }
    }

    pub fn with_private_dir(mut self, dir: PathBuf) -> Self {
        self.private_dirs.push(dir);
        self
    }

    /// Read-only host directories every jail gets.
    pub(crate) fn mirrored_dirs(&self) -> Vec<PathBuf> {
        let private: Vec<&Path> = self
            .private_dirs
            .iter()
            .map(PathBuf::as_path)
            .chain([self.run_root.as_path()])
            .collect();
        jail::mirrored_dirs(&self.search_path, &private)
    }
}
