//! task.rs - the download task: planning, launching slices, collecting outcomes and committing.

use crate::progress::{ProgressReporter, ProgressSink};
use crate::resource::{ProbeInfo, Resource};
use crate::retry::{fetch_with_retry, RetryPolicy};
use crate::slice::{slice_range, SliceContext, SliceSpan};
use crate::state::{self, SliceState};
use crate::types::{
    DownloadError, Result, SliceError, SliceFailure, SliceId, SliceOutcome, TaskConfig, TaskStatus,
};
use faststr::FastStr;
use log::{debug, error, info, warn};
use reqwest::Client;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Prefix of temp file names in the output directory.
const TEMP_PREFIX: &str = ".pdown-";

/// One download, resumable until it has been committed.
pub struct DownloadTask {
    resource: Resource,
    config: TaskConfig,
    file_name: String,
    target_path: PathBuf,
    temp_path: PathBuf,
    sidecar_path: PathBuf,
    /// `None` when the server did not tell.
    total_length: Option<u64>,
    /// Validators reported by the probe, saved with the flags.
    etag: Option<String>,
    last_modified: Option<String>,
    worker_count: usize,
    /// One flag per slice, only written by the coordinating task.
    slice_complete: Vec<bool>,
    status: TaskStatus,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl DownloadTask {
    /// Probes `url` and allocates the temp file.
    ///
    /// When a sidecar for the same URL and length is found in the output
    /// directory, its temp file and completion flags are picked up instead, so
    /// `resume` continues an earlier run.
    pub async fn new(url: impl Into<FastStr>, config: TaskConfig) -> Result<Self> {
        let resource = Resource::new(url, &config)?;
        Self::from_resource(resource, config).await
    }

    /// Like `new`, with a caller supplied HTTP client.
    pub async fn with_client(
        url: impl Into<FastStr>,
        config: TaskConfig,
        client: Client,
    ) -> Result<Self> {
        let resource = Resource::with_client(url, client)?;
        Self::from_resource(resource, config).await
    }

    async fn from_resource(resource: Resource, config: TaskConfig) -> Result<Self> {
        info!(
            "[Task] New download of '{}', {} worker(s) requested.",
            resource.url(),
            config.workers
        );

        let remote = resource.probe().await?;
        let total_length = remote.length;
        let file_name = config
            .file_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| resource.file_name());
        let target_path = config.output_dir.join(&file_name);
        let sidecar_path = state::sidecar_path(&config.output_dir, &file_name);

        let restored = if config.persist_state {
            restore(&sidecar_path, resource.url().as_str(), &remote).await
        } else {
            None
        };

        let (temp_path, worker_count, slice_complete) = match restored {
            Some(saved) => {
                info!(
                    "[Task] Continuing {} with {} of {} slice(s) already done.",
                    saved.temp_path.display(),
                    saved.slice_complete.iter().filter(|done| **done).count(),
                    saved.worker_count
                );
                (saved.temp_path, saved.worker_count, saved.slice_complete)
            }
            None => {
                let workers = effective_workers(config.workers, total_length);
                let temp_path = allocate_temp_file(&config.output_dir, total_length).await?;
                info!("[Task] Temp file created: {}", temp_path.display());
                (temp_path, workers, vec![false; workers])
            }
        };

        match total_length {
            Some(len) => info!("[Task] Size: {len} bytes, {worker_count} slice(s)."),
            None => info!("[Task] Size unknown, using a single stream."),
        }

        let task = Self {
            retry_policy: RetryPolicy::from_config(&config),
            resource,
            config,
            file_name,
            target_path,
            temp_path,
            sidecar_path,
            total_length,
            etag: remote.etag,
            last_modified: remote.last_modified,
            worker_count,
            slice_complete,
            status: TaskStatus::Pending,
            cancel: CancellationToken::new(),
            progress: None,
        };
        task.persist().await;
        Ok(task)
    }

    pub fn url(&self) -> &str {
        self.resource.url().as_str()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where the file lands after a successful download.
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    /// `ETag` of the remote file when the task was created.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Completion flag of every slice, in index order.
    pub fn slice_complete(&self) -> &[bool] {
        &self.slice_complete
    }

    /// Indices of slices that still have to be fetched.
    pub fn missing_slices(&self) -> Vec<SliceId> {
        self.slice_complete
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(id, _)| id)
            .collect()
    }

    /// True once every slice has been written.
    pub fn is_complete(&self) -> bool {
        self.slice_complete.iter().all(|done| *done)
    }

    /// Marks a slice as done without fetching it, for callers restoring
    /// their own state. Returns `false` for an unknown index.
    pub fn mark_slice_complete(&mut self, id: SliceId) -> bool {
        match self.slice_complete.get_mut(id) {
            Some(flag) => {
                *flag = true;
                true
            }
            None => false,
        }
    }

    /// Token that stops in-flight slices when cancelled. Once cancelled, any
    /// later run of this task fails fast.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replaces the progress reporter created for each run.
    pub fn set_progress(&mut self, sink: Arc<dyn ProgressSink>) {
        self.progress = Some(sink);
    }

    /// Fetches every slice, whatever its current flag, then commits.
    pub async fn start(&mut self) -> Result<()> {
        let ids: Vec<SliceId> = (0..self.worker_count).collect();
        info!("[Task] Starting {} slice(s).", ids.len());
        self.run(ids).await
    }

    /// Fetches only the slices not yet complete, then commits.
    pub async fn resume(&mut self) -> Result<()> {
        let ids = self.missing_slices();
        info!(
            "[Task] Resuming {} of {} slice(s).",
            ids.len(),
            self.worker_count
        );
        self.run(ids).await
    }

    async fn run(&mut self, ids: Vec<SliceId>) -> Result<()> {
        if self.status == TaskStatus::Complete {
            warn!("[Task] Already committed to {}.", self.target_path.display());
            return Ok(());
        }
        self.status = TaskStatus::Running;

        let progress = self.run_progress(&ids);
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<SliceOutcome>(ids.len().max(1));
        for &id in &ids {
            self.launch(id, progress.clone(), outcome_tx.clone());
        }
        drop(outcome_tx);

        // Collect exactly one outcome per launched slice, in arrival order.
        let mut failures = Vec::new();
        for _ in 0..ids.len() {
            let Some(SliceOutcome { id, result }) = outcome_rx.recv().await else {
                error!("[Task] Outcome channel closed early.");
                break;
            };
            match result {
                Ok(bytes) => {
                    debug!("[Task] Slice {id} complete ({bytes} bytes).");
                    self.slice_complete[id] = true;
                }
                Err(error) => {
                    error!("[Task] Failed to download slice {id}: {error}");
                    failures.push(SliceFailure { id, error });
                }
            }
            self.persist().await;
        }

        let complete = self.is_complete();
        progress.on_finish(complete);
        if complete {
            return self.commit().await;
        }

        self.status = TaskStatus::Incomplete;
        failures.sort_by_key(|f| f.id);
        warn!(
            "[Task] Incomplete, temp file kept at {} for resume.",
            self.temp_path.display()
        );
        Err(DownloadError::Incomplete { failures })
    }

    /// Spawns the fetcher for slice `id`. A panicking fetcher is still
    /// reported through the channel.
    fn launch(
        &self,
        id: SliceId,
        progress: Arc<dyn ProgressSink>,
        outcome_tx: mpsc::Sender<SliceOutcome>,
    ) {
        let ctx = SliceContext {
            id,
            span: self.span(id),
            workers: self.worker_count,
            client: self.resource.client().clone(),
            url: self.resource.url().clone(),
            temp_path: self.temp_path.clone(),
            progress,
            cancel: self.cancel.clone(),
        };
        let policy = self.retry_policy;
        spawn_supervised(
            id,
            async move { fetch_with_retry(&ctx, &policy).await },
            outcome_tx,
        );
    }

    fn span(&self, id: SliceId) -> SliceSpan {
        match self.total_length {
            None => SliceSpan::Whole,
            Some(len) => slice_range(len, self.worker_count, id)
                .map_or(SliceSpan::Empty, SliceSpan::Range),
        }
    }

    /// Bytes already on disk from completed slices that are not fetched again.
    fn settled_bytes(&self, launched: &[SliceId]) -> u64 {
        self.slice_complete
            .iter()
            .enumerate()
            .filter(|(id, done)| **done && !launched.contains(id))
            .map(|(id, _)| match self.span(id) {
                SliceSpan::Range(range) => range.len(),
                SliceSpan::Whole | SliceSpan::Empty => 0,
            })
            .sum()
    }

    fn run_progress(&self, launched: &[SliceId]) -> Arc<dyn ProgressSink> {
        if let Some(sink) = &self.progress {
            return sink.clone();
        }
        let reporter = ProgressReporter::new(self.total_length, self.config.show_progress);
        reporter.set_initial(self.settled_bytes(launched));
        Arc::new(reporter)
    }

    /// Writes the sidecar. Failures are logged, not returned.
    async fn persist(&self) {
        if !self.config.persist_state || self.total_length.is_none() {
            return;
        }
        let record = SliceState {
            url: self.url().to_string(),
            total_length: self.total_length,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            worker_count: self.worker_count,
            temp_path: self.temp_path.clone(),
            slice_complete: self.slice_complete.clone(),
        };
        if let Err(e) = state::save(&self.sidecar_path, &record).await {
            warn!("[Task] {e}");
        }
    }

    /// Renames the temp file to its final name.
    async fn commit(&mut self) -> Result<()> {
        if let Err(source) = tokio::fs::rename(&self.temp_path, &self.target_path).await {
            self.status = TaskStatus::Incomplete;
            return Err(DownloadError::Commit {
                from: self.temp_path.clone(),
                to: self.target_path.clone(),
                source,
            });
        }
        if self.config.persist_state {
            if let Err(e) = state::remove(&self.sidecar_path).await {
                warn!("[Task] {e}");
            }
        }
        self.status = TaskStatus::Complete;
        info!("[Task] Saved {}", self.target_path.display());
        Ok(())
    }
}

/// Loads the sidecar if it still describes the remote file.
async fn restore(path: &Path, url: &str, remote: &ProbeInfo) -> Option<SliceState> {
    let saved = state::load(path).await?;
    if saved.matches(url, remote) {
        Some(saved)
    } else {
        info!(
            "[Task] Saved state at {} does not match the remote file, starting over.",
            path.display()
        );
        None
    }
}

/// Runs `fetch` as its own task and sends its outcome for slice `id`. A panic
/// inside `fetch` is reported as `SliceError::Join`.
fn spawn_supervised<F>(id: SliceId, fetch: F, outcome_tx: mpsc::Sender<SliceOutcome>)
where
    F: Future<Output = std::result::Result<u64, SliceError>> + Send + 'static,
{
    spawn(async move {
        let result = spawn(fetch)
            .await
            .unwrap_or_else(|e| Err(SliceError::Join(e)));
        if outcome_tx.send(SliceOutcome { id, result }).await.is_err() {
            warn!("[Slice {id}] Task stopped listening for outcomes.");
        }
    });
}

/// Worker count actually used: one stream for an unknown length, never more
/// slices than bytes, at least one.
pub(crate) fn effective_workers(requested: usize, total_length: Option<u64>) -> usize {
    match total_length {
        None => 1,
        Some(len) => {
            let max = usize::try_from(len.max(1)).unwrap_or(usize::MAX);
            requested.clamp(1, max)
        }
    }
}

/// Creates a uniquely named temp file in `dir`, pre-sized when the length is known.
async fn allocate_temp_file(dir: &Path, total_length: Option<u64>) -> Result<PathBuf> {
    let target_dir = dir.to_path_buf();
    let created = tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
        std::fs::create_dir_all(&target_dir)?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&target_dir)?;
        if let Some(len) = total_length {
            temp.as_file().set_len(len)?;
        }
        let (_file, path) = temp.keep().map_err(|e| e.error)?;
        Ok(path)
    })
    .await
    .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

    created.map_err(|source| DownloadError::Storage {
        dir: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_length_forces_single_worker() {
        assert_eq!(effective_workers(8, None), 1);
    }

    #[test]
    fn test_workers_clamped_to_length() {
        assert_eq!(effective_workers(8, Some(1024)), 8);
        assert_eq!(effective_workers(8, Some(3)), 3);
        assert_eq!(effective_workers(8, Some(0)), 1);
        assert_eq!(effective_workers(0, Some(1024)), 1);
    }

    async fn panicking_fetch() -> std::result::Result<u64, SliceError> {
        panic!("fetcher blew up")
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_reported() {
        let (tx, mut rx) = mpsc::channel(2);
        spawn_supervised(3, panicking_fetch(), tx.clone());
        spawn_supervised(5, async { Ok::<u64, SliceError>(7) }, tx);

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.id);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].id, 3);
        assert!(matches!(outcomes[0].result, Err(SliceError::Join(_))));
        assert_eq!(outcomes[1].id, 5);
        assert!(matches!(outcomes[1].result, Ok(7)));
    }

    #[tokio::test]
    async fn test_temp_file_is_presized() {
        let dir = tempfile::tempdir().unwrap();
        let path = allocate_temp_file(dir.path(), Some(4096)).await.unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_PREFIX)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        let other = allocate_temp_file(dir.path(), None).await.unwrap();
        assert_ne!(path, other);
        assert_eq!(std::fs::metadata(&other).unwrap().len(), 0);
    }
}
