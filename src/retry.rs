//! Retry classification and exponential backoff for remote calls.
//!
//! Every remote failure is classified into an [`ErrorClass`]:
//! - [`ErrorClass::Transient`] - network faults and 5xx that may clear
//! - [`ErrorClass::RateLimited`] - 429/408, retried honoring Retry-After
//! - [`ErrorClass::Quota`] - quota exhaustion, retried with a long floor
//! - [`ErrorClass::Auth`] - 401 after the single credential refresh
//! - [`ErrorClass::Permanent`] - 403/404 and other failures retries can't fix
//!
//! [`RetryPolicy::decide`] turns a classification and attempt count into a
//! [`RetryDecision`], computing `min(base * multiplier^attempt + jitter,
//! max_delay)` and treating a server-provided Retry-After as a lower bound.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::api::ApiError;

/// Default retry ceiling for folder listings.
pub const DEFAULT_WALK_ATTEMPTS: u32 = 3;

/// Default retry ceiling for file downloads.
pub const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Minimum backoff applied to quota-exhaustion failures (30 seconds).
const QUOTA_MIN_DELAY: Duration = Duration::from_secs(30);

/// Maximum honored Retry-After value (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of a remote failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network faults, timeouts, HTTP 5xx.
    Transient,

    /// Server-side rate limiting (HTTP 429) or request timeout (408).
    RateLimited,

    /// Quota exhaustion: HTTP 403 with a quota/user-rate reason.
    ///
    /// Retried, but with a long minimum backoff since quotas replenish on
    /// whole-seconds-to-minutes horizons.
    Quota,

    /// Authentication failure that survived the single token refresh.
    Auth,

    /// Failure retries cannot fix: 403 (non-quota), 404, other 4xx,
    /// malformed responses.
    Permanent,
}

impl ErrorClass {
    /// Short label used in logs and error summaries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate-limited",
            Self::Quota => "quota",
            Self::Auth => "auth",
            Self::Permanent => "permanent",
        }
    }
}

/// Decision on whether to retry a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is
        /// attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// With defaults, delays are approximately 1s, 2s, 4s, 8s (before the
/// attempt ceiling), capped at 60s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom attempt ceiling, defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Creates a new policy with custom settings.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after a classified failure.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    /// `retry_after` is the server-provided delay, honored as a lower bound
    /// on the computed backoff.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        match class {
            ErrorClass::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            ErrorClass::Auth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication failed after credential refresh".to_string(),
                };
            }
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Quota => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let mut delay = self.calculate_delay(attempt);
        if class == ErrorClass::Quota {
            delay = delay.max(QUOTA_MIN_DELAY);
        }
        if let Some(server_delay) = retry_after {
            delay = delay.max(server_delay);
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            class = class.as_str(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and
    /// jitter: `min(base_delay * multiplier^attempt, max_delay) + jitter`.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 0-indexed for the exponent (attempt 1 = multiplier^0)
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + calculate_jitter()
    }
}

/// Generates random jitter between 0 and [`MAX_JITTER`].
///
/// Jitter prevents thundering herd when multiple workers fail
/// simultaneously and retry at the same time.
#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Classifies a remote API error for retry decisions.
///
/// # HTTP Status Classification
///
/// | Status | Class | Rationale |
/// |--------|-------|-----------|
/// | 401 | Auth | adapter already spent its single refresh |
/// | 403 (quota reason) | Quota | replenishes; retry with long floor |
/// | 403 (other) | Permanent | forbidden item |
/// | 404 | Permanent | item disappeared remotely |
/// | 408 | RateLimited | request timeout; retry with backoff |
/// | 429 | RateLimited | server throttling |
/// | other 4xx | Permanent | request is wrong, not the weather |
/// | 5xx | Transient | server may recover |
#[must_use]
pub fn classify(error: &ApiError) -> ErrorClass {
    match error {
        ApiError::Network { .. } | ApiError::Timeout { .. } => ErrorClass::Transient,
        ApiError::Auth { .. } => ErrorClass::Auth,
        ApiError::Decode { .. } => ErrorClass::Permanent,
        ApiError::HttpStatus { status, reason, .. } => classify_http(*status, reason.as_deref()),
    }
}

fn classify_http(status: u16, reason: Option<&str>) -> ErrorClass {
    match status {
        401 => ErrorClass::Auth,
        403 => match reason {
            Some("userRateLimitExceeded" | "rateLimitExceeded" | "quotaExceeded"
            | "dailyLimitExceeded") => ErrorClass::Quota,
            _ => ErrorClass::Permanent,
        },
        404 | 410 => ErrorClass::Permanent,
        408 | 429 => ErrorClass::RateLimited,
        status if (400..500).contains(&status) => ErrorClass::Permanent,
        status if (500..600).contains(&status) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats: integer seconds and HTTP-date. Returns
/// `None` for unparseable values; caps excessive values at 1 hour.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Integer seconds first (most common)
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    // HTTP-date
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

/// Extracts the server-provided retry delay from an error, if any.
#[must_use]
pub fn retry_after_delay(error: &ApiError) -> Option<Duration> {
    error.retry_after().and_then(parse_retry_after)
}
