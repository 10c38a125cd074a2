use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sandbox::LanguageProfile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Scratch directory layout under the service base directory.
///
/// ```text
/// <base>/scratch/sources/<id><ext>   one stored source per sandbox
/// <base>/scratch/runs/run-XXXX/      per-execution dirs (owned by the worker)
/// ```
pub struct ScratchStorage {
    sources: PathBuf,
    runs: PathBuf,
}

impl ScratchStorage {
    pub fn new(base_dir: &Path) -> Self {
        let scratch = base_dir.join("scratch");
        Self {
            sources: scratch.join("sources"),
            runs: scratch.join("runs"),
        }
    }

    pub fn sources_dir(&self) -> &Path {
        &self.sources
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.sources).await?;
        tokio::fs::create_dir_all(&self.runs).await
    }

    /// Storage path for a sandbox. Built from the generated id and the
    /// profile's validated extension only, never from caller input.
    pub fn source_path(&self, id: Uuid, profile: &LanguageProfile) -> PathBuf {
        self.sources
            .join(format!("{id}{}", profile.file_extension))
    }

    /// Write a new source file. Fails if the file exists; a partial file is
    /// removed before returning an error.
    pub async fn write(&self, path: &Path, code: &str) -> std::io::Result<()> {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await?;
            file.write_all(code.as_bytes()).await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = &result
            && e.kind() != ErrorKind::AlreadyExists
        {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }

    /// Delete a stored source. Already-missing files count as deleted.
    pub async fn remove(&self, path: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Remove everything a previous process left behind. Returns the number
    /// of entries removed.
    pub async fn sweep_orphans(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for dir in [&self.sources, &self.runs] {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let result = if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphan"),
                }
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned scratch entries");
        }
        Ok(removed)
    }
}
