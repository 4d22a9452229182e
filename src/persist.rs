//! Durable JSON storage helpers shared by the evidence and artifact stores

use crate::error::PipelineResult;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

/// Write bytes atomically (temp file in the same dir + rename)
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Content written to a temp file beside its destination, not yet visible
/// at the destination itself
#[derive(Debug)]
pub struct StagedWrite {
    pub path: PathBuf,
    tmp: PathBuf,
    /// Destination content before the commit; `None` when it did not exist
    previous: Option<Vec<u8>>,
}

impl StagedWrite {
    pub async fn stage(path: &Path, bytes: &[u8]) -> PipelineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let previous = match fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(Self {
            path: path.to_path_buf(),
            tmp,
            previous,
        })
    }

    /// Move the staged content into place
    pub async fn commit(&self) -> PipelineResult<()> {
        fs::rename(&self.tmp, &self.path).await?;
        Ok(())
    }

    /// Drop uncommitted content
    pub async fn discard(&self) {
        let _ = fs::remove_file(&self.tmp).await;
    }

    /// Undo a commit, putting back the previous content or absence
    pub async fn revert(&self) -> PipelineResult<()> {
        match &self.previous {
            Some(bytes) => write_bytes_atomic(&self.path, bytes).await,
            None => match fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

/// Load every `*.json` file in a directory. Unreadable entries are skipped
/// with a warning so one corrupt file cannot hide the rest of the store.
pub async fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> PipelineResult<Vec<(PathBuf, T)>> {
    let mut out = Vec::new();
    if !fs::try_exists(dir).await? {
        return Ok(out);
    }

    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let bytes = fs::read(&path).await?;
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => out.push((path, value)),
            Err(e) => warn!("Skipping unreadable store entry {}: {}", path.display(), e),
        }
    }
    Ok(out)
}
