//! Build cache — content-addressed tar archives of workspace directories.
//!
//! An archive name is derived from the repository, the cached path and the
//! SHA-256 of a key file, so identical inputs always map to the same archive
//! and archives never change once written.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::services::executor::{self, CommandError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Archive(#[from] CommandError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A directory to persist between builds, keyed by the content of `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub source: String,
    digest: Option<String>,
}

impl CacheEntry {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            digest: None,
        }
    }
}

pub struct CacheService {
    directory: PathBuf,
    validity: Duration,
    max_size: Option<u64>,
}

impl CacheService {
    pub fn new(directory: PathBuf, validity: Duration, max_size: Option<u64>) -> Self {
        Self {
            directory,
            validity,
            max_size,
        }
    }

    #[cfg(test)]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Archive name for `entry`, or `None` when its key file does not exist.
    pub async fn cache_filename(
        &self,
        repo_name: &str,
        root: &Path,
        entry: &mut CacheEntry,
    ) -> Result<Option<String>, CacheError> {
        if entry.digest.is_none() {
            let source = root.join(&entry.source);
            match tokio::fs::read(&source).await {
                Ok(content) => entry.digest = Some(hex::encode(Sha256::digest(&content))),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(
                        repo = repo_name,
                        path = %entry.path,
                        source = %entry.source,
                        "cache key file missing, skipping entry"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(io_error(&source)(e)),
            }
        }

        let Some(digest) = entry.digest.as_deref() else {
            return Ok(None);
        };
        let path = entry.path.replace('/', "_");
        Ok(Some(format!("{repo_name}-{path}-{digest}.tar")))
    }

    /// Extract every available archive into `root`; returns the restored paths.
    pub async fn restore(
        &self,
        repo_name: &str,
        root: &Path,
        entries: &mut [CacheEntry],
    ) -> Result<Vec<String>, CacheError> {
        self.ensure_directory().await?;
        self.prune().await?;

        let mut restored = Vec::new();
        for entry in entries.iter_mut() {
            let Some(name) = self.cache_filename(repo_name, root, entry).await? else {
                continue;
            };
            let archive = self.directory.join(&name);
            if !exists(&archive).await? {
                tracing::debug!(repo = repo_name, archive = %name, "no cached archive");
                continue;
            }

            executor::run_tool(
                "tar",
                [
                    OsStr::new("-xf"),
                    archive.as_os_str(),
                    OsStr::new("-C"),
                    root.as_os_str(),
                ],
                None,
            )
            .await?;

            tracing::info!(repo = repo_name, path = %entry.path, archive = %name, "restored cache");
            restored.push(entry.path.clone());
        }

        crate::metrics::cache_restored(restored.len());
        Ok(restored)
    }

    /// Archive every existing entry path not already cached; returns the saved paths.
    pub async fn save(
        &self,
        repo_name: &str,
        root: &Path,
        entries: &mut [CacheEntry],
    ) -> Result<Vec<String>, CacheError> {
        self.ensure_directory().await?;

        let mut saved = Vec::new();
        for entry in entries.iter_mut() {
            if !exists(&root.join(&entry.path)).await? {
                tracing::debug!(repo = repo_name, path = %entry.path, "cache path missing, not saving");
                continue;
            }
            let Some(name) = self.cache_filename(repo_name, root, entry).await? else {
                continue;
            };
            let archive = self.directory.join(&name);
            if exists(&archive).await? {
                tracing::debug!(repo = repo_name, archive = %name, "archive already cached");
                continue;
            }

            // Archived under a temporary name, then renamed into place.
            let partial = tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(&self.directory)
                .map_err(io_error(&self.directory))?;
            executor::run_tool(
                "tar",
                [
                    OsStr::new("-cf"),
                    partial.path().as_os_str(),
                    OsStr::new("-C"),
                    root.as_os_str(),
                    OsStr::new(&entry.path),
                ],
                None,
            )
            .await?;
            partial
                .persist(&archive)
                .map_err(|e| io_error(&archive)(e.error))?;

            tracing::info!(repo = repo_name, path = %entry.path, archive = %name, "saved cache");
            saved.push(entry.path.clone());
        }

        crate::metrics::cache_saved(saved.len());
        Ok(saved)
    }

    /// Drop expired archives, then the oldest ones until the size budget is met.
    /// Returns the number of archives removed.
    pub async fn prune(&self) -> Result<usize, CacheError> {
        let archives = self.list_archives().await?;
        let now = SystemTime::now();
        let mut removed = 0;

        let (expired, kept): (Vec<_>, Vec<_>) = archives.into_iter().partition(|a| {
            now.duration_since(a.modified)
                .map(|age| age > self.validity)
                .unwrap_or(false)
        });
        for archive in &expired {
            self.remove_archive(archive, "expired").await?;
            removed += 1;
        }

        if let Some(max_size) = self.max_size {
            let mut kept = kept;
            kept.sort_by_key(|a| a.modified);
            let mut total: u64 = kept.iter().map(|a| a.size).sum();
            for archive in &kept {
                if total <= max_size {
                    break;
                }
                self.remove_archive(archive, "over size budget").await?;
                total -= archive.size;
                removed += 1;
            }
        }

        if removed > 0 {
            crate::metrics::cache_pruned(removed);
        }
        Ok(removed)
    }

    async fn ensure_directory(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_error(&self.directory))
    }

    async fn list_archives(&self) -> Result<Vec<Archive>, CacheError> {
        let mut archives = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(archives),
            Err(e) => return Err(io_error(&self.directory)(e)),
        };

        while let Some(item) = dir.next_entry().await.map_err(io_error(&self.directory))? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tar") {
                continue;
            }
            let metadata = item.metadata().await.map_err(io_error(&path))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().map_err(io_error(&path))?;
            archives.push(Archive {
                path,
                size: metadata.len(),
                modified,
            });
        }
        Ok(archives)
    }

    async fn remove_archive(&self, archive: &Archive, reason: &str) -> Result<(), CacheError> {
        tracing::debug!(archive = %archive.path.display(), reason, "pruning cache archive");
        match tokio::fs::remove_file(&archive.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&archive.path)(e)),
        }
    }
}

struct Archive {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

async fn exists(path: &Path) -> Result<bool, CacheError> {
    tokio::fs::try_exists(path).await.map_err(io_error(path))
}
