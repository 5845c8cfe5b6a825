//! Bounded, per-slice retry with exponential backoff.

use crate::slice::{fetch_slice, SliceContext};
use crate::types::{SliceError, TaskConfig};
use log::{debug, info, warn};
use reqwest::StatusCode;
use std::time::Duration;

/// How often and how patiently a failed slice is fetched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the doubled delays.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Transport faults, short bodies, throttling and server errors are
    /// transient. A status the worker count cannot use, a client error or a
    /// cancellation is final.
    pub fn is_retryable(error: &SliceError) -> bool {
        match error {
            SliceError::Request(_) | SliceError::ShortBody { .. } => true,
            SliceError::UnexpectedStatus { status } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::OK);
                status == StatusCode::TOO_MANY_REQUESTS
                    || status == StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
            }
            SliceError::Io(_) | SliceError::Cancelled | SliceError::Join(_) => false,
        }
    }
}

/// Fetches a slice, retrying transient failures within the policy's budget.
///
/// Bytes reported by a failed attempt are rewound from the progress sink
/// before the next one starts. Returns the bytes written by the successful
/// attempt.
pub(crate) async fn fetch_with_retry(
    ctx: &SliceContext,
    policy: &RetryPolicy,
) -> Result<u64, SliceError> {
    let id = ctx.id;
    let mut retry = 0;
    loop {
        let mut written = 0;
        let error = match fetch_slice(ctx, &mut written).await {
            Ok(()) => return Ok(written),
            Err(e) => e,
        };

        if retry >= policy.max_retries || !RetryPolicy::is_retryable(&error) {
            return Err(error);
        }
        retry += 1;
        ctx.progress.on_rewind(written);

        let delay = policy.delay_for(retry);
        warn!(
            "[Slice {id}] Attempt failed: {error}. Retry {retry} of {} in {delay:?}.",
            policy.max_retries
        );
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!("[Slice {id}] Cancelled while waiting to retry.");
                return Err(SliceError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => debug!("[Slice {id}] Retrying now."),
        }
    }
}
