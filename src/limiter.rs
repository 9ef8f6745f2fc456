//! Token-bucket admission for remote calls and download bandwidth.
//!
//! Two limiters share one bucket implementation:
//! - [`RateLimiter`] admits remote API calls at `rate` tokens/sec with a
//!   `burst` cap. Every outbound call acquires one token first.
//! - [`BandwidthLimiter`] meters download throughput on the read side of
//!   every stream, one acquire per chunk, sized by the chunk.
//!
//! Both are designed to be wrapped in `Arc` and shared across Tokio tasks.
//! `acquire` blocks until capacity is available or the supplied cancellation
//! token fires, so a cancelled sync never sits in the admission queue.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// The operation was cancelled while waiting for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled while waiting for rate limiter")]
pub struct Cancelled;

/// Shared token-bucket state.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously at `rate` per second, capped at
/// `burst`.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until `amount` tokens are available, then consumes them.
    ///
    /// Amounts above the burst cap are clamped to it so a single oversized
    /// request cannot deadlock the bucket.
    async fn acquire(&self, amount: f64, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let amount = amount.min(self.burst);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
                state.last_refill = Instant::now();

                if state.tokens >= amount {
                    state.tokens -= amount;
                    return Ok(());
                }
                Duration::from_secs_f64((amount - state.tokens) / self.rate)
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }
}

/// Admission limiter for remote API calls.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<TokenBucket>,
}

impl RateLimiter {
    /// Creates a limiter admitting `rate_per_sec` calls/sec with the given
    /// burst.
    #[must_use]
    #[instrument]
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        debug!("creating API rate limiter");
        if rate_per_sec <= 0.0 {
            return Self::disabled();
        }
        Self {
            bucket: Some(TokenBucket::new(rate_per_sec, f64::from(burst.max(1)))),
        }
    }

    /// Creates a limiter that admits everything immediately.
    #[must_use]
    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.bucket.is_none()
    }

    /// Blocks until one call token is available or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the cancellation token fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        match &self.bucket {
            Some(bucket) => bucket.acquire(1.0, cancel).await,
            None => Ok(()),
        }
    }
}

/// Global download bandwidth cap, applied per chunk on the read side.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Option<TokenBucket>,
}

impl BandwidthLimiter {
    /// Creates a limiter capping reads at `bytes_per_sec` (0 = unlimited).
    ///
    /// The burst is one second's worth of bytes, so short stalls do not
    /// permanently cost throughput.
    #[must_use]
    #[instrument]
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self { bucket: None };
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = bytes_per_sec as f64;
        Self {
            bucket: Some(TokenBucket::new(rate, rate)),
        }
    }

    /// Returns whether the cap is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.bucket.is_none()
    }

    /// Blocks until `len` bytes of budget are available or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the cancellation token fires first.
    pub async fn acquire_bytes(
        &self,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        match &self.bucket {
            #[allow(clippy::cast_precision_loss)]
            Some(bucket) => bucket.acquire(len as f64, cancel).await,
            None => Ok(()),
        }
    }
}
