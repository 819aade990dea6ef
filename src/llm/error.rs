//! Classified LLM errors and the retry policy applied to them.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Broad category of a failed model call. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the backend.
    RateLimited,
    /// 5xx from the backend.
    ServerError,
    /// 4xx other than 429 (bad model name, bad request, auth).
    ClientError,
    /// Connection refused, DNS failure, reset.
    NetworkError,
    /// The call did not complete within the configured deadline.
    Timeout,
    /// The backend answered but the body was not what we expected.
    ParseError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RateLimited => "rate limited",
            Self::ServerError => "server error",
            Self::ClientError => "client error",
            Self::NetworkError => "network error",
            Self::Timeout => "timeout",
            Self::ParseError => "parse error",
        };
        f.write_str(label)
    }
}

/// Error returned by every [`super::LlmClient`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Delay requested by the backend (Retry-After header).
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            status: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message)
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ServerError, message)
        }
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ClientError, message)
        }
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, message)
    }

    pub fn timeout(message: String) -> Self {
        Self::new(LlmErrorKind::Timeout, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, message)
    }

    /// Map a transport error from reqwest onto our taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("Request timeout: {}", err))
        } else if err.is_connect() {
            Self::network_error(format!("Connection failed: {}", err))
        } else {
            Self::network_error(format!("Request failed: {}", err))
        }
    }

    /// Whether a second identical request has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::Timeout
        )
    }
}

/// Classify an HTTP status code returned by a model backend.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Timeout,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ClientError,
    }
}

/// Bounded retry with exponential backoff for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Hard ceiling on the total time spent retrying one request.
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retry_duration: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// No retries at all; used by tests and connectivity checks.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, error: &LlmError) -> bool {
        error.is_transient()
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, error: &LlmError, attempt: u32) -> Duration {
        if let Some(delay) = error.retry_after {
            return delay.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `request` until it succeeds, fails permanently, or the retry budget
    /// is spent. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut request: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match request().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            "{} succeeded after {} retries (total time: {:?})",
                            label,
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !self.should_retry(&error) || attempt >= self.max_retries {
                        if attempt > 0 {
                            tracing::error!(
                                "{} failed after {} retries (total time: {:?}): {}",
                                label,
                                attempt,
                                start.elapsed(),
                                error
                            );
                        } else {
                            tracing::error!("{} failed: {}", label, error);
                        }
                        return Err(error);
                    }

                    let remaining = self
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    let delay = self.delay_for(&error, attempt).min(remaining);
                    if delay.is_zero() {
                        tracing::warn!(
                            "{} retry {} failed, no time remaining: {}",
                            label,
                            attempt + 1,
                            error
                        );
                        return Err(error);
                    }

                    tracing::warn!(
                        "{} retry {} failed with {}, retrying in {:?}: {}",
                        label,
                        attempt + 1,
                        error.kind,
                        delay,
                        error.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
