// state.rs
use crate::resource::ProbeInfo;
use crate::types::{DownloadError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of the sidecar file written next to the temp file.
const SIDECAR_SUFFIX: &str = ".pdown";

/// Resumable state of a task, persisted as JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SliceState {
    pub url: String,
    pub total_length: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    pub worker_count: usize,
    pub temp_path: PathBuf,
    pub slice_complete: Vec<bool>,
}

impl SliceState {
    /// Whether this record belongs to a download of `url` whose remote copy
    /// is unchanged (same length and validators), and can still be continued.
    pub fn matches(&self, url: &str, remote: &ProbeInfo) -> bool {
        self.url == url
            && self.total_length.is_some()
            && self.total_length == remote.length
            && self.etag == remote.etag
            && self.last_modified == remote.last_modified
            && self.worker_count > 0
            && self.slice_complete.len() == self.worker_count
            && self.temp_path.is_file()
    }
}

/// Location of the sidecar for a final file `file_name` in `dir`.
pub fn sidecar_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!(".{file_name}{SIDECAR_SUFFIX}"))
}

/// Reads a sidecar. A missing or unreadable record yields `None`, the
/// download then simply starts over.
pub async fn load(path: &Path) -> Option<SliceState> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("[State] Cannot read {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(state) => {
            debug!("[State] Loaded {}", path.display());
            Some(state)
        }
        Err(e) => {
            warn!("[State] Ignoring corrupt {}: {e}", path.display());
            None
        }
    }
}

/// Writes the sidecar through a temporary sibling and a rename, so a crash
/// never leaves a half written record.
pub async fn save(path: &Path, state: &SliceState) -> Result<()> {
    let to_err = |source: io::Error| DownloadError::State {
        path: path.to_path_buf(),
        source,
    };
    let data = serde_json::to_vec_pretty(state).map_err(|e| to_err(e.into()))?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, data)
        .await
        .map_err(to_err)?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(to_err)?;
    debug!("[State] Saved {}", path.display());
    Ok(())
}

/// Deletes the sidecar; a missing file is fine.
pub async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DownloadError::State {
            path: path.to_path_buf(),
            source,
        }),
    }
}
