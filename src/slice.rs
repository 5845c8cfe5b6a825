//! Slice planning and the fetcher that downloads one slice into the temp file.

use crate::progress::ProgressSink;
use crate::types::{SliceError, SliceId};
use faststr::FastStr;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// An inclusive byte range `[start, end]` of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub start: u64,
    pub end: u64,
}

impl SliceRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Range` request header for this slice.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Range assigned to slice `id` when `total_length` bytes are split across `workers`.
///
/// Every slice gets `total_length / workers` bytes and the last one absorbs the
/// remainder. Returns `None` when the slice holds no bytes, which only happens
/// for an empty resource or when `workers` exceeds `total_length`.
pub fn slice_range(total_length: u64, workers: usize, id: SliceId) -> Option<SliceRange> {
    if workers == 0 || id >= workers {
        return None;
    }
    let workers = workers as u64;
    let id = id as u64;
    let slice_len = total_length / workers;
    let start = slice_len * id;
    let end = if id == workers - 1 {
        total_length.checked_sub(1)?
    } else {
        (start + slice_len).checked_sub(1)?
    };
    (start <= end).then_some(SliceRange { start, end })
}

/// All slice ranges of a resource, in index order.
pub fn plan_slices(total_length: u64, workers: usize) -> Vec<SliceRange> {
    (0..workers)
        .filter_map(|id| slice_range(total_length, workers, id))
        .collect()
}

/// What a fetcher has to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceSpan {
    /// A known byte range, requested with a `Range` header.
    Range(SliceRange),
    /// The whole resource of unknown length, requested without `Range`.
    Whole,
    /// Nothing to fetch (empty resource).
    Empty,
}

/// Everything a spawned fetcher needs; cloned per launch.
#[derive(Clone)]
pub(crate) struct SliceContext {
    pub id: SliceId,
    pub span: SliceSpan,
    /// Number of slices of the whole task, decides which statuses are accepted.
    pub workers: usize,
    pub client: Client,
    pub url: FastStr,
    pub temp_path: PathBuf,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
}

/// Checks a response status against the worker count.
///
/// With several workers only `206 Partial Content` is usable: anything else
/// means the server ignored the range. A single worker also accepts `200 OK`.
pub(crate) fn check_status(status: StatusCode, workers: usize) -> Result<(), SliceError> {
    let accepted = if workers > 1 {
        status == StatusCode::PARTIAL_CONTENT
    } else {
        status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT
    };
    if accepted {
        Ok(())
    } else {
        Err(SliceError::UnexpectedStatus {
            status: status.as_u16(),
        })
    }
}

/// Downloads one slice and writes it at its offset in the temp file.
///
/// The fetcher opens its own handle, so concurrent slices never share a file
/// cursor. Bytes are forwarded to the progress sink as they are written and
/// `written` tracks how many went through, also on failure, so a retry can
/// rewind the sink.
pub(crate) async fn fetch_slice(ctx: &SliceContext, written: &mut u64) -> Result<(), SliceError> {
    let id = ctx.id;
    *written = 0;

    let range = match ctx.span {
        SliceSpan::Empty => {
            debug!("[Slice {id}] Empty resource, nothing to fetch.");
            return Ok(());
        }
        SliceSpan::Whole => None,
        SliceSpan::Range(range) => Some(range),
    };

    if ctx.cancel.is_cancelled() {
        return Err(SliceError::Cancelled);
    }

    let mut file = OpenOptions::new().write(true).open(&ctx.temp_path).await?;
    let start = range.map_or(0, |r| r.start);
    file.seek(SeekFrom::Start(start)).await?;

    let mut request = ctx.client.get(ctx.url.as_str());
    match range {
        Some(range) => {
            info!("[Slice {id}] Starting, range: {}-{}.", range.start, range.end);
            request = request.header(RANGE, range.header_value());
        }
        None => info!("[Slice {id}] Starting full-stream fetch of unknown length."),
    }

    let response = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(SliceError::Cancelled),
        response = request.send() => response.map_err(|e| {
            error!("[Slice {id}] Request failed: {e}");
            SliceError::from(e)
        })?,
    };

    if let Err(e) = check_status(response.status(), ctx.workers) {
        warn!("[Slice {id}] Rejected response: {e}");
        return Err(e);
    }
    debug!("[Slice {id}] Response accepted with status {}.", response.status());

    let expected = range.map(|r| r.len());
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!("[Slice {id}] Cancelled after {} bytes.", *written);
                let _ = file.flush().await;
                return Err(SliceError::Cancelled);
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(mut chunk)) => {
                if let Some(expected) = expected {
                    let allowed = expected - *written;
                    if allowed == 0 {
                        debug!("[Slice {id}] Ignoring data past the slice end.");
                        break;
                    }
                    if chunk.len() as u64 > allowed {
                        trace!("[Slice {id}] Trimming chunk to {allowed} bytes.");
                        chunk.truncate(allowed as usize);
                    }
                }
                file.write_all(&chunk).await?;
                let len = chunk.len() as u64;
                *written += len;
                ctx.progress.on_bytes(len);
                trace!("[Slice {id}] Wrote {len} bytes, {} in total.", *written);
            }
            Some(Err(e)) => {
                error!("[Slice {id}] Body stream error: {e}");
                return Err(e.into());
            }
            None => break,
        }
    }

    file.flush().await?;

    match expected {
        Some(expected) if *written < expected => {
            warn!("[Slice {id}] Body ended after {} of {expected} bytes.", *written);
            return Err(SliceError::ShortBody {
                expected,
                received: *written,
            });
        }
        Some(_) => {}
        // a full stream may be shorter than a previous attempt left on disk
        None => file.set_len(*written).await?,
    }

    info!("[Slice {id}] Finished, {} bytes written.", *written);
    Ok(())
}
