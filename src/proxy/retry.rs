//! Retry and fallback coordination.
//!
//! Walks the candidate list in order, applying per-provider transport
//! retries and the zero-output-token retry policy, and guaranteeing exactly
//! one circuit breaker update per logical attempt:
//! - transport retries against the same candidate do not touch the breaker
//!   until the budget is exhausted
//! - a zero-output response only counts as a failure once its own retry
//!   budget is spent
//! - cancellation (dropping the walk's future) records nothing and does
//!   not advance the list
//!
//! Failed attempts accumulate in a caller-owned `Arc<Mutex<Vec<_>>>` so the
//! history survives if the surrounding future is cancelled by a deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RoutingConfig;
use crate::proxy::circuit_breaker::{Acquire, CircuitBreakerRegistry, ProbeGuard};
use crate::router::Candidate;

/// Fixed exponential backoff between transport retries: 1s, 2s, then 4s
/// for every subsequent retry.
const BACKOFF_DURATIONS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Record of one failed logical attempt, in order, for the
/// `x-tiergate-attempts` header and the exhaustion error.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub provider: String,
    pub model: String,
    pub reason: String,
    pub status: Option<u16>,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(
                f,
                "{} ({}): {} [status {}]",
                self.provider, self.model, self.reason, code
            ),
            None => write!(f, "{} ({}): {}", self.provider, self.model, self.reason),
        }
    }
}

/// Why a single try against a provider failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// Connection-level failure (connect error, reset, protocol error).
    Transport(String),
    /// The provider's per-attempt timeout elapsed.
    Timeout,
    /// Upstream returned a non-success status.
    Status { code: u16, message: String },
}

impl AttemptError {
    /// Breaker error category.
    pub fn error_type(&self) -> &'static str {
        match self {
            AttemptError::Transport(_) => "transport",
            AttemptError::Timeout => "timeout",
            AttemptError::Status { .. } => "status",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AttemptError::Transport(m) => m.clone(),
            AttemptError::Timeout => "request timed out".to_string(),
            AttemptError::Status { code, message } => {
                format!("upstream status {}: {}", code, message)
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Transport-level errors are retried against the same candidate;
    /// everything else fails the candidate immediately.
    fn same_candidate_retryable(&self) -> bool {
        matches!(self, AttemptError::Transport(_) | AttemptError::Timeout)
    }
}

/// A syntactically successful try, with the output token count the
/// coordinator needs for the zero-output policy.
pub struct Attempt<T> {
    pub value: T,
    pub output_tokens: u32,
}

/// Zero-output retry policy, snapshotted from the routing config.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_on_zero_output: bool,
    pub zero_output_retries: u32,
}

impl From<&RoutingConfig> for RetryPolicy {
    fn from(cfg: &RoutingConfig) -> Self {
        Self {
            retry_on_zero_output: cfg.retry_on_zero_output_tokens,
            zero_output_retries: cfg.zero_output_retries,
        }
    }
}

/// The candidate that finally served the request.
#[derive(Debug)]
pub struct CandidateSuccess<T> {
    pub value: T,
    pub provider: String,
    pub model: String,
}

/// Every candidate was skipped or failed.
///
/// Client cancellation is not an error value here: it propagates by
/// dropping the `run_candidates` future, which records nothing and does
/// not advance the walk (a held [`ProbeGuard`] releases its permit on
/// drop).
#[derive(Debug, PartialEq, Eq)]
pub struct Exhausted;

fn backoff(retry_index: u32) -> Duration {
    let i = (retry_index as usize).min(BACKOFF_DURATIONS.len() - 1);
    BACKOFF_DURATIONS[i]
}

/// Format attempt records into the `x-tiergate-attempts` header value.
///
/// Format: `"2/alpha, 1/beta"`: count of failed attempts per provider,
/// preserving first-appearance order. `None` when nothing failed.
pub fn format_attempts_header(attempts: &[AttemptFailure]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts.iter_mut().find(|(name, _)| *name == attempt.provider) {
            entry.1 += 1;
        } else {
            counts.push((&attempt.provider, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn push_failure(
    attempts: &Mutex<Vec<AttemptFailure>>,
    candidate: &Candidate,
    reason: String,
    status: Option<u16>,
) {
    attempts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(AttemptFailure {
            provider: candidate.provider.name.clone(),
            model: candidate.model.clone(),
            reason,
            status,
        });
}

/// Walk the candidate list until one try succeeds.
///
/// For each candidate, in order:
/// 1. Consult the breaker: Open circuits and probe-busy providers are
///    skipped (recorded, not counted); a Half-Open candidate claims the
///    single probe permit via [`ProbeGuard`].
/// 2. Each try is bounded by the provider's timeout; timeouts count as
///    transport failures. Transport failures are retried against the same
///    candidate up to `max_retries` with exponential backoff.
/// 3. A zero-output success is retried against the same candidate up to
///    the policy budget; only full exhaustion records a breaker failure.
/// 4. Exactly one breaker update happens per logical attempt, then the
///    walk advances.
///
/// The closure performs one raw try; it must not touch the breaker itself.
pub async fn run_candidates<T, F, Fut>(
    candidates: &[Candidate],
    breakers: &CircuitBreakerRegistry,
    policy: &RetryPolicy,
    attempts: Arc<Mutex<Vec<AttemptFailure>>>,
    send_request: F,
) -> Result<CandidateSuccess<T>, Exhausted>
where
    F: Fn(&Candidate) -> Fut,
    Fut: std::future::Future<Output = Result<Attempt<T>, AttemptError>>,
{
    for candidate in candidates {
        let key = candidate.provider.key();

        let mut probe_guard = match breakers.try_acquire(&key) {
            Acquire::Allowed => None,
            Acquire::Probe => {
                tracing::info!(provider = %key, "attempting recovery probe");
                Some(ProbeGuard::new(breakers, key.clone()))
            }
            Acquire::Open { reason } => {
                push_failure(&attempts, candidate, format!("circuit open: {}", reason), None);
                continue;
            }
            Acquire::ProbeInFlight => {
                push_failure(&attempts, candidate, "recovery probe in flight".to_string(), None);
                continue;
            }
        };

        let mut transport_retries = 0u32;
        let mut zero_output_tries = 0u32;
        let timeout = candidate.provider.timeout();

        let failure = loop {
            let try_result = match tokio::time::timeout(timeout, send_request(candidate)).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Timeout),
            };

            match try_result {
                Ok(attempt) => {
                    if attempt.output_tokens == 0 && policy.retry_on_zero_output {
                        if zero_output_tries < policy.zero_output_retries {
                            zero_output_tries += 1;
                            tracing::warn!(
                                provider = %key,
                                model = %candidate.model,
                                try_number = zero_output_tries,
                                "response had zero output tokens, retrying same provider"
                            );
                            continue;
                        }
                        // Budget spent: one logical failure
                        break ZeroOrAttempt::ZeroOutput;
                    }

                    match probe_guard.take() {
                        Some(guard) => guard.success(),
                        None => breakers.record_success(&key),
                    }
                    return Ok(CandidateSuccess {
                        value: attempt.value,
                        provider: candidate.provider.name.clone(),
                        model: candidate.model.clone(),
                    });
                }
                Err(err) => {
                    if err.same_candidate_retryable() && transport_retries < candidate.provider.max_retries
                    {
                        let delay = backoff(transport_retries);
                        transport_retries += 1;
                        tracing::warn!(
                            provider = %key,
                            error = %err.message(),
                            retry = transport_retries,
                            delay_ms = delay.as_millis() as u64,
                            "transport failure, retrying same provider"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break ZeroOrAttempt::Attempt(err);
                }
            }
        };

        let (error_type, message) = match &failure {
            ZeroOrAttempt::ZeroOutput => (
                "zero_output",
                "response produced no output tokens after retries".to_string(),
            ),
            ZeroOrAttempt::Attempt(err) => (err.error_type(), err.message()),
        };

        tracing::warn!(
            provider = %key,
            model = %candidate.model,
            error_type,
            error = %message,
            "provider attempt failed, falling back"
        );

        match probe_guard.take() {
            Some(guard) => guard.failure(error_type, &message),
            None => breakers.record_failure(&key, error_type, &message),
        }

        let status = match &failure {
            ZeroOrAttempt::Attempt(err) => err.status(),
            ZeroOrAttempt::ZeroOutput => None,
        };
        push_failure(&attempts, candidate, message, status);
    }

    Err(Exhausted)
}

/// Internal marker distinguishing the zero-output logical failure from a
/// plain attempt error in the per-candidate loop.
enum ZeroOrAttempt {
    ZeroOutput,
    Attempt(AttemptError),
}
