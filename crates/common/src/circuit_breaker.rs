//! Circuit breaker guarding one backing store.
//!
//! Trips after `failure_threshold` failures inside a sliding window and stays
//! open for a cooldown that grows with every consecutive open. While half-open
//! exactly one probe is admitted at a time.
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

use crate::config::CircuitBreakerSettings;

#[cfg(feature = "telemetry")]
use opentelemetry::{global, metrics::Counter, KeyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub window: Duration,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            window: Duration::from_secs(60),
            base_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self {
            name: name.into(),
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            window: Duration::from_secs(settings.window_secs),
            base_cooldown: Duration::from_millis(settings.base_cooldown_ms),
            max_cooldown: Duration::from_millis(settings.max_cooldown_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Cooldown after the `open_count`-th consecutive open.
    fn cooldown(&self, open_count: u32) -> Duration {
        let exponent = open_count.saturating_sub(1).min(32) as i32;
        let millis = self.base_cooldown.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_cooldown.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Point-in-time view used by status reporting and health checks.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub consecutive_successes: usize,
    pub open_count: u32,
    pub state_age_ms: u64,
    pub retry_after_ms: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    changed_at: Instant,
    failures: VecDeque<Instant>,
    consecutive_successes: usize,
    /// Opens since the breaker was last closed.
    open_count: u32,
    next_retry_at: Option<Instant>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            changed_at: Instant::now(),
            failures: VecDeque::new(),
            consecutive_successes: 0,
            open_count: 0,
            next_retry_at: None,
            probe_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(ts) = self.failures.front() {
            if now.duration_since(*ts) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && self.next_retry_at.is_some_and(|at| now >= at)
    }

    fn retry_after(&self, now: Instant) -> Duration {
        self.next_retry_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// How an operation's failure counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    /// The store answered but the caller's work failed (cancellation, bad SQL),
    /// or the pool had no spare connection.
    Neutral,
}

fn verdict_for(err: &SluiceError) -> Verdict {
    if err.is_cancellation() {
        return Verdict::Neutral;
    }
    match (&err.code, &err.context) {
        (
            ErrorCode::ExecutionFailed,
            Some(ErrorContext::Execution {
                transient: false, ..
            }),
        ) => Verdict::Neutral,
        (ErrorCode::InvalidQuery | ErrorCode::PoolExhausted, _) => Verdict::Neutral,
        _ => Verdict::Failure,
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,

    #[cfg(feature = "telemetry")]
    transition_counter: Counter<u64>,
    #[cfg(feature = "telemetry")]
    request_counter: Counter<u64>,
}

/// Admission ticket. Releases the half-open probe slot if dropped unresolved.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl Admission<'_> {
    fn resolve(mut self, verdict: Verdict) {
        self.resolved = true;
        self.breaker.record(verdict, self.probe);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.inner.write().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        #[cfg(feature = "telemetry")]
        let meter = global::meter("sluice-circuit-breaker");
        #[cfg(feature = "telemetry")]
        let transition_counter = meter
            .u64_counter("circuit_breaker_transitions_total")
            .with_description("Total number of circuit breaker state transitions")
            .build();
        #[cfg(feature = "telemetry")]
        let request_counter = meter
            .u64_counter("circuit_breaker_requests_total")
            .with_description("Total number of requests processed by circuit breaker")
            .build();

        Self {
            config,
            inner: RwLock::new(BreakerInner::new()),

            #[cfg(feature = "telemetry")]
            transition_counter,
            #[cfg(feature = "telemetry")]
            request_counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CircuitState {
        // Double-checked locking pattern
        let now = Instant::now();
        {
            let inner = self.inner.read();
            if !inner.cooldown_elapsed(now) {
                return inner.state;
            }
        }

        let mut inner = self.inner.write();
        // Verify condition again under write lock
        if inner.cooldown_elapsed(now) {
            self.half_open(&mut inner, now);
        }
        inner.state
    }

    /// Run `op` under the breaker.
    ///
    /// Rejected calls fail with `CircuitOpen` and never invoke `op`.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, SluiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SluiceError>>,
    {
        let admission = self.admit()?;
        let result = op().await;
        let verdict = match &result {
            Ok(_) => Verdict::Success,
            Err(e) => verdict_for(e),
        };
        admission.resolve(verdict);
        result
    }

    pub fn record_success(&self) {
        self.record(Verdict::Success, false);
    }

    pub fn record_failure(&self) {
        self.record(Verdict::Failure, false);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.prune(now, self.config.window);
        BreakerSnapshot {
            name: self.config.name.clone(),
            state,
            failures_in_window: inner.failures.len(),
            consecutive_successes: inner.consecutive_successes,
            open_count: inner.open_count,
            state_age_ms: now.duration_since(inner.changed_at).as_millis() as u64,
            retry_after_ms: (state == CircuitState::Open)
                .then(|| inner.retry_after(now).as_millis() as u64),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force the breaker closed and forget its history.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let from = inner.state;
        let totals = (
            inner.total_successes,
            inner.total_failures,
            inner.total_rejections,
        );
        *inner = BreakerInner::new();
        (
            inner.total_successes,
            inner.total_failures,
            inner.total_rejections,
        ) = totals;
        if from != CircuitState::Closed {
            self.log_transition(from, CircuitState::Closed);
        }
    }

    fn admit(&self) -> Result<Admission<'_>, SluiceError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        if inner.cooldown_elapsed(now) {
            self.half_open(&mut inner, now);
        }

        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                probe: false,
                resolved: false,
            }),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    probe: true,
                    resolved: false,
                })
            }
            CircuitState::HalfOpen => {
                inner.total_rejections += 1;
                // A probe is running; its verdict lands well before a full cooldown.
                Err(self.open_error(self.config.base_cooldown.min(Duration::from_millis(100))))
            }
            CircuitState::Open => {
                inner.total_rejections += 1;
                Err(self.open_error(inner.retry_after(now)))
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> SluiceError {
        let retry_after_ms = retry_after.as_millis() as u64;
        SluiceError::new(
            ErrorCode::CircuitOpen,
            format!("Circuit breaker '{}' is open", self.config.name),
        )
        .with_context(ErrorContext::CircuitOpen {
            breaker: self.config.name.clone(),
            retry_after_ms,
        })
        .with_hint(format!("Retry after {} ms", retry_after_ms))
    }

    fn record(&self, verdict: Verdict, probe: bool) {
        #[cfg(feature = "telemetry")]
        self.request_counter.add(
            1,
            &[
                KeyValue::new("name", self.config.name.clone()),
                KeyValue::new(
                    "result",
                    match verdict {
                        Verdict::Success => "success",
                        Verdict::Failure => "failure",
                        Verdict::Neutral => "neutral",
                    },
                ),
            ],
        );

        let now = Instant::now();
        let mut inner = self.inner.write();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.prune(now, self.config.window);

        match verdict {
            Verdict::Neutral => {}
            Verdict::Success => {
                inner.total_successes += 1;
                match inner.state {
                    CircuitState::Closed => {
                        // Decay: each success forgives the oldest failure.
                        inner.failures.pop_front();
                    }
                    CircuitState::HalfOpen => {
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.config.success_threshold {
                            self.transition(&mut inner, CircuitState::Closed, now);
                            inner.failures.clear();
                            inner.open_count = 0;
                            inner.next_retry_at = None;
                        }
                    }
                    CircuitState::Open => {}
                }
            }
            Verdict::Failure => {
                inner.total_failures += 1;
                match inner.state {
                    CircuitState::Closed => {
                        inner.failures.push_back(now);
                        if inner.failures.len() >= self.config.failure_threshold {
                            self.trip(&mut inner, now);
                        }
                    }
                    CircuitState::HalfOpen => self.trip(&mut inner, now),
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.open_count = inner.open_count.saturating_add(1);
        let cooldown = self.config.cooldown(inner.open_count);
        inner.next_retry_at = Some(now + cooldown);
        inner.consecutive_successes = 0;
        self.transition(inner, CircuitState::Open, now);
        tracing::warn!(
            target: "breaker",
            breaker = %self.config.name,
            open_count = inner.open_count,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn half_open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.consecutive_successes = 0;
        inner.probe_in_flight = false;
        self.transition(inner, CircuitState::HalfOpen, now);
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = new_state;
        inner.changed_at = now;
        self.log_transition(from, new_state);
    }

    fn log_transition(&self, from: CircuitState, to: CircuitState) {
        #[cfg(feature = "telemetry")]
        self.transition_counter.add(
            1,
            &[
                KeyValue::new("name", self.config.name.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );

        tracing::info!(
            target: "breaker",
            breaker = %self.config.name,
            from = %from,
            to = %to,
            "Circuit breaker transition"
        );
    }
}
