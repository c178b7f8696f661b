//! Circuit breaker state machine for per-provider health tracking.
//!
//! Implements the Closed -> Open -> Half-Open -> Closed lifecycle:
//! - **Closed**: requests flow normally, consecutive failures are counted
//! - **Open**: requests are rejected, waits for the recovery timeout to expire
//! - **Half-Open**: a single probe request is allowed to test recovery
//!
//! This module contains:
//! - Core state machine (`CircuitBreakerInner`)
//! - Concurrent registry (`CircuitBreakerRegistry`) backed by DashMap,
//!   records created lazily on first observed attempt
//! - RAII `ProbeGuard` to prevent stuck probe_in_flight flags
//!
//! The Open -> Half-Open transition happens lazily at read time: there is no
//! background timer, the first selection or acquisition after the timeout
//! performs the transition. While a probe is in flight, other requests skip
//! the provider rather than queue behind the probe.

use std::time::Duration;

use dashmap::DashMap;

use crate::config::{CircuitBreakerConfig, ProviderKey};

/// The three states of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Requests flow through, failures are counted.
    Closed,
    /// Circuit tripped. All requests are rejected until timeout expires.
    Open,
    /// Recovery probe. One request is allowed through to test provider health.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of a single provider's circuit breaker state.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub key: ProviderKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub trip_count: u32,
    pub last_error: Option<LastError>,
}

/// Whether the Selector should include a provider in the candidate list.
///
/// Read-only from the caller's perspective, but performs the lazy
/// Open -> Half-Open transition when the recovery timeout has expired.
/// Does NOT claim the probe permit; that happens at attempt time via
/// [`CircuitBreakerRegistry::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selectable {
    /// Circuit Closed: include normally.
    Yes,
    /// Circuit Half-Open with no probe in flight: include as a probe candidate.
    Probe,
    /// Circuit Open, or Half-Open with a probe already in flight: skip.
    No,
}

/// Result of claiming permission to attempt a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// Circuit Closed: proceed normally.
    Allowed,
    /// Caller holds the single Half-Open probe permit and MUST resolve it
    /// (use [`ProbeGuard`]).
    Probe,
    /// Circuit Open: skip this provider.
    Open { reason: String },
    /// Another probe is in flight: skip rather than queue.
    ProbeInFlight,
}

/// Information about the last error that caused a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// Category of the error (e.g., "status", "timeout", "zero_output").
    pub error_type: String,
    /// Human-readable error message.
    pub message: String,
}

/// Core circuit breaker state machine (not thread-safe on its own).
///
/// Wrapped in `Mutex<CircuitBreakerInner>` inside the registry entries
/// for thread-safe access.
struct CircuitBreakerInner {
    state: CircuitState,
    /// Consecutive failure count (resets on success).
    failure_count: u32,
    /// When the circuit transitioned to Open (for timeout calculation).
    opened_at: Option<tokio::time::Instant>,
    last_failure_time: Option<tokio::time::Instant>,
    last_success_time: Option<tokio::time::Instant>,
    /// Details of the most recent error.
    last_error: Option<LastError>,
    /// Total number of times this circuit has tripped open.
    trip_count: u32,
    /// Whether a probe request is currently in flight (Half-Open single-permit).
    probe_in_flight: bool,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure_time: None,
            last_success_time: None,
            last_error: None,
            trip_count: 0,
            probe_in_flight: false,
        }
    }

    /// Perform the lazy Open -> Half-Open transition if the timeout expired.
    fn maybe_half_open(&mut self, recovery_timeout: Duration) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if tokio::time::Instant::now().duration_since(opened_at) >= recovery_timeout {
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = false;
                tracing::info!("circuit entering Half-Open: recovery timeout expired");
            }
        }
    }

    /// Non-claiming view for the Selector.
    fn selectable(&mut self, recovery_timeout: Duration) -> Selectable {
        self.maybe_half_open(recovery_timeout);
        match self.state {
            CircuitState::Closed => Selectable::Yes,
            CircuitState::Open => Selectable::No,
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Selectable::No
                } else {
                    Selectable::Probe
                }
            }
        }
    }

    /// Claiming check at attempt time.
    fn acquire(&mut self, recovery_timeout: Duration) -> Acquire {
        self.maybe_half_open(recovery_timeout);
        match self.state {
            CircuitState::Closed => Acquire::Allowed,
            CircuitState::Open => Acquire::Open {
                reason: self
                    .last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.error_type, e.message))
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Acquire::ProbeInFlight
                } else {
                    self.probe_in_flight = true;
                    Acquire::Probe
                }
            }
        }
    }

    /// Record a failure in Closed state.
    ///
    /// Increments consecutive failure counter. If the threshold is reached,
    /// transitions to Open state.
    fn record_failure(
        &mut self,
        key: &ProviderKey,
        threshold: u32,
        error_type: &str,
        message: &str,
    ) {
        self.failure_count += 1;
        self.last_failure_time = Some(tokio::time::Instant::now());
        self.last_error = Some(LastError {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });

        if self.state == CircuitState::Closed && self.failure_count >= threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(tokio::time::Instant::now());
            self.trip_count += 1;

            tracing::warn!(
                provider = %key,
                failure_count = self.failure_count,
                last_error = ?self.last_error,
                trip_count = self.trip_count,
                "circuit OPENED: {} consecutive failures",
                self.failure_count,
            );
        }
    }

    /// Record a success in Closed state. Resets the failure counter.
    fn record_success(&mut self, key: &ProviderKey) {
        self.failure_count = 0;
        self.last_success_time = Some(tokio::time::Instant::now());

        tracing::debug!(
            provider = %key,
            "circuit breaker: success recorded, failure count reset",
        );
    }

    /// Record that the probe request in Half-Open state succeeded.
    ///
    /// Transitions Half-Open -> Closed.
    fn record_probe_success(&mut self, key: &ProviderKey) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.probe_in_flight = false;
        self.last_success_time = Some(tokio::time::Instant::now());

        tracing::info!(
            provider = %key,
            trip_count = self.trip_count,
            "circuit CLOSED: probe succeeded",
        );
    }

    /// Record that the probe request in Half-Open state failed.
    ///
    /// Transitions Half-Open -> Open with a fresh timeout.
    fn record_probe_failure(&mut self, key: &ProviderKey, error_type: &str, message: &str) {
        self.state = CircuitState::Open;
        self.opened_at = Some(tokio::time::Instant::now());
        self.probe_in_flight = false;
        self.last_error = Some(LastError {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });

        tracing::warn!(
            provider = %key,
            trip_count = self.trip_count,
            "circuit REOPENED: probe failed",
        );
    }

    /// Release the probe permit without resolving the probe.
    ///
    /// The circuit stays Half-Open so the next caller may probe
    /// immediately. Used when the probe was abandoned (client
    /// cancellation), which says nothing about provider health.
    fn release_probe(&mut self, key: &ProviderKey) {
        if self.state == CircuitState::HalfOpen && self.probe_in_flight {
            self.probe_in_flight = false;
            tracing::debug!(provider = %key, "probe abandoned, permit released");
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Concurrent circuit breaker registry with one breaker per provider identity.
///
/// Backed by [`DashMap`] for per-shard locking (no cross-provider contention).
/// Breakers are created lazily on first access, so providers added to the
/// registry at runtime are covered without any registration step.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<ProviderKey, std::sync::Mutex<CircuitBreakerInner>>,
    settings: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> CircuitBreakerConfig {
        self.settings
    }

    fn with_breaker<R>(&self, key: &ProviderKey, f: impl FnOnce(&mut CircuitBreakerInner) -> R) -> R {
        let entry = self
            .breakers
            .entry(key.clone())
            .or_insert_with(|| std::sync::Mutex::new(CircuitBreakerInner::new()));
        let mut inner = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Selector-side view: may a request consider this provider right now?
    ///
    /// Performs the lazy Open -> Half-Open transition but does not claim
    /// the probe permit.
    pub fn selectable(&self, key: &ProviderKey) -> Selectable {
        let timeout = self.settings.recovery_timeout();
        self.with_breaker(key, |inner| inner.selectable(timeout))
    }

    /// Attempt-side claim: returns `Acquire::Probe` at most once per
    /// Half-Open cycle. Lock is released before the caller awaits anything.
    pub fn try_acquire(&self, key: &ProviderKey) -> Acquire {
        let timeout = self.settings.recovery_timeout();
        self.with_breaker(key, |inner| inner.acquire(timeout))
    }

    /// Record a successful request (Closed state). Resets the failure counter.
    pub fn record_success(&self, key: &ProviderKey) {
        self.with_breaker(key, |inner| inner.record_success(key));
    }

    /// Record a failed request (Closed state).
    ///
    /// Increments failure counter; may trip the circuit to Open.
    pub fn record_failure(&self, key: &ProviderKey, error_type: &str, message: &str) {
        let threshold = self.settings.failure_threshold;
        self.with_breaker(key, |inner| {
            inner.record_failure(key, threshold, error_type, message)
        });
    }

    /// Record that the half-open probe succeeded. Transitions to Closed.
    pub fn record_probe_success(&self, key: &ProviderKey) {
        self.with_breaker(key, |inner| inner.record_probe_success(key));
    }

    /// Record that the half-open probe failed. Reopens with a fresh timer.
    pub fn record_probe_failure(&self, key: &ProviderKey, error_type: &str, message: &str) {
        self.with_breaker(key, |inner| inner.record_probe_failure(key, error_type, message));
    }

    /// Release an unresolved probe permit, leaving the circuit Half-Open.
    pub fn release_probe(&self, key: &ProviderKey) {
        self.with_breaker(key, |inner| inner.release_probe(key));
    }

    /// Return a snapshot of all tracked circuit states.
    ///
    /// Uses DashMap::iter() which acquires per-shard locks (not a global lock).
    /// Providers that have never been attempted have no entry here; callers
    /// should treat absence as Closed.
    pub fn all_states(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| {
                let inner = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                CircuitSnapshot {
                    key: entry.key().clone(),
                    state: inner.state,
                    failure_count: inner.failure_count,
                    trip_count: inner.trip_count,
                    last_error: inner.last_error.clone(),
                }
            })
            .collect()
    }

    /// Current state for one provider; `None` if never attempted.
    pub fn state(&self, key: &ProviderKey) -> Option<CircuitState> {
        self.breakers
            .get(key)
            .map(|entry| entry.value().lock().unwrap_or_else(|e| e.into_inner()).state)
    }

    /// Current consecutive failure count; `None` if never attempted.
    pub fn failure_count(&self, key: &ProviderKey) -> Option<u32> {
        self.breakers.get(key).map(|entry| {
            entry
                .value()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .failure_count
        })
    }

    /// Cumulative trip count; `None` if never attempted.
    pub fn trip_count(&self, key: &ProviderKey) -> Option<u32> {
        self.breakers.get(key).map(|entry| {
            entry
                .value()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .trip_count
        })
    }
}

// ── ProbeGuard RAII ──────────────────────────────────────────────────

/// RAII guard that ensures a half-open probe permit is always returned.
///
/// If dropped without calling [`success`](ProbeGuard::success) or
/// [`failure`](ProbeGuard::failure) (a canceled request, typically), the
/// permit is released and the circuit stays Half-Open: an abandoned probe
/// says nothing about provider health, and the flag must not stay stuck.
pub struct ProbeGuard<'a> {
    registry: &'a CircuitBreakerRegistry,
    key: ProviderKey,
    resolved: bool,
}

impl<'a> ProbeGuard<'a> {
    pub fn new(registry: &'a CircuitBreakerRegistry, key: ProviderKey) -> Self {
        Self {
            registry,
            key,
            resolved: false,
        }
    }

    /// Mark the probe as successful. Closes the circuit.
    pub fn success(mut self) {
        self.resolved = true;
        self.registry.record_probe_success(&self.key);
    }

    /// Mark the probe as failed. Reopens the circuit with a fresh timer.
    pub fn failure(mut self, error_type: &str, message: &str) {
        self.resolved = true;
        self.registry.record_probe_failure(&self.key, error_type, message);
    }
}

impl<'a> Drop for ProbeGuard<'a> {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.release_probe(&self.key);
        }
    }
}
