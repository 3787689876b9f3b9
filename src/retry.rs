use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::util::parse_retry_after;

/// What one attempt produced, as seen by the retry policy.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timeout_phase: Option<TimeoutPhase>,
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

/// Result of [`RetryPolicy::evaluate`].
///
/// `error` is set when a reply that otherwise looks successful should be treated as a
/// failure, i.e. a retryable status.
#[derive(Debug)]
pub struct RetryVerdict {
    pub should_retry: bool,
    pub error: Option<Error>,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    min_wait: Duration,
    max_wait: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retryable_timeout_phases: BTreeSet<TimeoutPhase>,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("min_wait", &self.min_wait)
            .field("max_wait", &self.max_wait)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retryable_timeout_phases", &self.retryable_timeout_phases)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// No retries; waits of 1s to 30s once retries are enabled.
    pub fn standard() -> Self {
        Self {
            max_retries: 0,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            jitter_ratio: 0.0,
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retryable_timeout_phases: default_retryable_timeout_phases(),
            retry_classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        if self.max_wait < self.min_wait {
            self.max_wait = self.min_wait;
        }
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait.max(self.min_wait);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retryable_timeout_phases(
        mut self,
        phases: impl IntoIterator<Item = TimeoutPhase>,
    ) -> Self {
        self.retryable_timeout_phases = phases.into_iter().collect();
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        if let Some(kind) = decision.transport_error_kind {
            return self.retryable_transport_error_kinds.contains(&kind);
        }
        if let Some(phase) = decision.timeout_phase {
            return self.retryable_timeout_phases.contains(&phase);
        }
        false
    }

    /// Decides whether the attempt described by `decision` should be repeated.
    ///
    /// A canceled call is never retried. A retryable status comes back with an
    /// [`Error::UnexpectedStatus`] describing it.
    pub fn evaluate(&self, token: &CancellationToken, decision: &RetryDecision) -> RetryVerdict {
        if token.is_cancelled() {
            return RetryVerdict {
                should_retry: false,
                error: None,
            };
        }

        let should_retry = self.should_retry_decision(decision);
        let error = match decision.status {
            Some(status) if should_retry => Some(Error::UnexpectedStatus {
                status,
                method: decision.method.clone(),
                uri: decision.uri.clone(),
            }),
            _ => None,
        };
        RetryVerdict {
            should_retry,
            error,
        }
    }

    /// Wait before retry number `retry_index` (0 for the first retry).
    ///
    /// `min * 2^retry_index`, clamped to `[min, max]`. A `Retry-After` header on a
    /// 429 or 503 reply replaces the computed value, still capped at `max`.
    pub fn backoff(
        &self,
        retry_index: usize,
        status: Option<StatusCode>,
        headers: Option<&HeaderMap>,
    ) -> Duration {
        if let (Some(status), Some(headers)) = (status, headers)
            && matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
            )
            && let Some(retry_after) = parse_retry_after(headers, SystemTime::now())
        {
            return retry_after.min(self.max_wait);
        }

        let exponent = retry_index.min(31) as u32;
        let delay = self
            .min_wait
            .saturating_mul(1_u32 << exponent)
            .clamp(self.min_wait, self.max_wait);
        self.apply_jitter(delay)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let min_wait_ms = self.min_wait.as_millis().min(u64::MAX as u128) as u64;
        let max_wait_ms = self.max_wait.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span).max(min_wait_ms);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_wait_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// 429 plus every 5xx except 501 Not Implemented.
fn default_retryable_status_codes() -> BTreeSet<u16> {
    std::iter::once(429_u16)
        .chain((500_u16..=599).filter(|status| *status != 501))
        .collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

fn default_retryable_timeout_phases() -> BTreeSet<TimeoutPhase> {
    [TimeoutPhase::Transport].into_iter().collect()
}
