/// Public types shared across the crate: errors, configuration and slice outcomes.
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// --- Public types ---

/// Index of a slice (and of the worker that fetches it).
pub type SliceId = usize;

/// Crate-wide `Result` alias with `DownloadError` as the error type.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors that end a task operation.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The URL could not be parsed.
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// The HTTP client could not be built from the configuration.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    /// The HEAD probe failed at the transport level.
    #[error("metadata probe failed: {0}")]
    Probe(#[source] reqwest::Error),
    /// The temp file could not be created or sized.
    #[error("failed to allocate temp file in {dir}: {source}")]
    Storage {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The resume sidecar could not be read or written.
    #[error("failed to persist task state at {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// One or more slices failed; the temp file is kept for a later resume.
    #[error("download incomplete: {} slice(s) failed {:?}", .failures.len(), failed_ids(.failures))]
    Incomplete { failures: Vec<SliceFailure> },
    /// The final rename of the temp file failed.
    #[error("failed to move {from} to {to}: {source}")]
    Commit {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    /// Indices of the failed slices when this is an `Incomplete` error.
    pub fn failed_slices(&self) -> Vec<SliceId> {
        match self {
            DownloadError::Incomplete { failures } => failed_ids(failures),
            _ => Vec::new(),
        }
    }
}

fn failed_ids(failures: &[SliceFailure]) -> Vec<SliceId> {
    failures.iter().map(|f| f.id).collect()
}

/// Why a single slice did not finish.
#[derive(Debug, Error)]
pub enum SliceError {
    /// The ranged GET failed or its body stream broke.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a status this worker count cannot use.
    #[error("unexpected status code: {status}")]
    UnexpectedStatus { status: u16 },
    /// Opening, seeking or writing the temp file failed.
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
    /// The body ended before the whole slice arrived.
    #[error("body ended early: expected {expected} bytes, received {received}")]
    ShortBody { expected: u64, received: u64 },
    /// The task's cancellation token fired.
    #[error("cancelled")]
    Cancelled,
    /// The fetcher task panicked or was aborted.
    #[error("fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A failed slice together with its cause.
#[derive(Debug)]
pub struct SliceFailure {
    pub id: SliceId,
    pub error: SliceError,
}

/// Lifecycle of a `DownloadTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Constructed, nothing launched yet.
    Pending,
    /// Slices are in flight.
    Running,
    /// Every slice finished and the temp file was renamed.
    Complete,
    /// The last run left at least one slice unfinished.
    Incomplete,
}

/// Default client identification; some servers route by user agent.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0";

/// Configuration for a `DownloadTask`.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Requested number of slices fetched concurrently.
    /// Forced to 1 when the resource length is unknown.
    pub workers: usize,
    /// Final file name. Derived from the URL path when `None`.
    pub file_name: Option<String>,
    /// Directory holding the temp file, the sidecar and the final file.
    pub output_dir: PathBuf,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Connect timeout for the HTTP client. Reads are not bounded.
    pub connect_timeout: Duration,
    /// Extra attempts per slice after a retryable failure. `0` disables retry.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub initial_retry_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_delay: Duration,
    /// Write the completion flags to a sidecar so another process can resume.
    pub persist_state: bool,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            file_name: None,
            output_dir: PathBuf::from("."),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
            max_retries: 0,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            persist_state: true,
            show_progress: false,
        }
    }
}

// --- Internal messages ---

/// Sent by a slice fetcher to the coordinating task over the result channel.
#[derive(Debug)]
pub(crate) struct SliceOutcome {
    pub id: SliceId,
    /// Bytes written on success.
    pub result: std::result::Result<u64, SliceError>,
}
