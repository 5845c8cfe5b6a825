//! A parallel, resumable HTTP downloader.
//!
//! # Features
//!
//! - **Parallel slices**: the resource is split into contiguous byte ranges,
//!   each fetched by its own task with a `Range` request and written straight
//!   to its offset in a shared temp file.
//! - **Resume**: completion is tracked per slice; `DownloadTask::resume`
//!   fetches only what is missing, and a JSON sidecar next to the temp file
//!   lets another process pick the download up.
//! - **Cancellation**: every slice watches a `CancellationToken`.
//! - **Optional retry**: a bounded exponential backoff per slice, off by
//!   default.
//!
//! # Architecture
//!
//! - **`DownloadTask`**: probes the size with HEAD, allocates the temp file,
//!   launches one fetcher per slice and collects their outcomes over a single
//!   channel. Only the task touches the completion flags. When all flags are
//!   set the temp file is renamed to its final name.
//! - **Slice fetchers**: independent units, each opening its own file handle,
//!   so writes need no locking.
//! - **`ProgressSink`**: a shared, thread-safe byte counter every fetcher
//!   reports through.
//!
//! # Example
//!
//! ```rust,no_run
//! use pdown::{DownloadError, DownloadTask, TaskConfig};
//!
//! #[tokio::main]
//! async fn main() -> pdown::Result<()> {
//!     let config = TaskConfig {
//!         workers: 8,
//!         show_progress: true,
//!         ..Default::default()
//!     };
//!     let mut task = DownloadTask::new("https://example.com/large.iso", config).await?;
//!
//!     match task.start().await {
//!         Err(DownloadError::Incomplete { .. }) => task.resume().await,
//!         other => other,
//!     }
//! }
//! ```

mod progress;
mod resource;
mod retry;
mod slice;
mod state;
mod task;
mod types;

// --- Public API ---

pub use progress::{ProgressReporter, ProgressSink};
pub use resource::{file_name_from_url, parse_content_length, ProbeInfo, Resource};
pub use retry::RetryPolicy;
pub use slice::{plan_slices, slice_range, SliceRange};
pub use state::{sidecar_path, SliceState};
pub use task::DownloadTask;
// Re-exported so callers can build a custom client for `DownloadTask::with_client`.
pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use types::{
    DownloadError, Result, SliceError, SliceFailure, SliceId, TaskConfig, TaskStatus,
    DEFAULT_USER_AGENT,
};
