//! Progress reporting shared by all slice fetchers.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const BAR_TEMPLATE: &str =
    " {spinner:.green} [{msg}] [{wide_bar:.yellow/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = " {spinner:.green} [{msg}] {bytes} ({bytes_per_sec})";

/// Receives byte counts from every active fetcher.
///
/// Implementations must tolerate concurrent calls. A sink is purely
/// observational and has no way to fail a download.
pub trait ProgressSink: Send + Sync {
    /// `bytes` more bytes were written to the target.
    fn on_bytes(&self, bytes: u64);

    /// `bytes` previously reported bytes were discarded because a slice is
    /// being fetched again.
    fn on_rewind(&self, _bytes: u64) {}

    /// The run ended; `complete` tells whether every slice finished.
    fn on_finish(&self, _complete: bool) {}
}

/// Shared byte counter driving an optional terminal progress bar.
#[derive(Clone)]
pub struct ProgressReporter {
    downloaded: Arc<AtomicU64>,
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Creates a reporter for a resource of `total` bytes (`None` if unknown).
    /// The bar is only drawn when `visible` is set.
    pub fn new(total: Option<u64>, visible: bool) -> Self {
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        let template = if total.is_some() {
            BAR_TEMPLATE
        } else {
            SPINNER_TEMPLATE
        };
        // a malformed template only costs the styling
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message("Downloading");
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            downloaded: Arc::new(AtomicU64::new(0)),
            bar,
        }
    }

    /// Reporter that only counts.
    pub fn hidden(total: Option<u64>) -> Self {
        Self::new(total, false)
    }

    /// Starts the counter at `bytes`, e.g. the size of slices finished earlier.
    pub fn set_initial(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::Relaxed);
        self.bar.set_position(bytes);
    }

    /// Bytes written so far.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

impl ProgressSink for ProgressReporter {
    fn on_bytes(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.bar.inc(bytes);
    }

    fn on_rewind(&self, bytes: u64) {
        let _ = self
            .downloaded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        self.bar.dec(bytes);
    }

    fn on_finish(&self, complete: bool) {
        debug!(
            "[Progress] Run finished after {} bytes, complete: {complete}.",
            self.downloaded()
        );
        if complete {
            self.bar.finish_with_message("Done");
        } else {
            self.bar.abandon_with_message("Incomplete");
        }
    }
}
