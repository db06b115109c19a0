//! Per-node circuit breaker: CLOSED/OPEN/HALF_OPEN state machine over a
//! bounded rolling latency window, with listener callbacks fired outside the
//! state lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub retry_timeout: Duration,
    pub latency_threshold: Duration,
    pub latency_consecutive_checks: u32,
    pub latency_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            retry_timeout: Duration::from_secs(30),
            latency_threshold: Duration::from_secs(8),
            latency_consecutive_checks: 3,
            latency_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// A zero threshold is the idiomatic way to disable the latency trigger
    /// entirely — every success would otherwise count as slow.
    fn latency_trigger_enabled(&self) -> bool {
        self.latency_threshold > Duration::ZERO
    }
}

impl From<&crate::config::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(config: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            retry_timeout: Duration::from_millis(config.retry_timeout_ms),
            latency_threshold: Duration::from_millis(config.latency_threshold_ms),
            latency_consecutive_checks: config.latency_consecutive_checks,
            latency_window: Duration::from_millis(config.latency_window_ms),
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    latency_ms: f64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    consecutive_slow: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<chrono::DateTime<chrono::Utc>>,
    samples: VecDeque<Sample>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            consecutive_slow: 0,
            opened_at: None,
            opened_at_wall: None,
            samples: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Wire shape returned by `GET /v1/circuit-breaker/metrics`. Latency numbers
/// are rounded to two decimals here, at the wire boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub avg_latency_ms: f64,
    pub latency_samples: usize,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub consecutive_high_latency: u32,
    pub next_attempt: Option<String>,
    pub timestamp: String,
}

pub type StateChangeListener = Arc<dyn Fn(CircuitState, &str) + Send + Sync>;

/// One breaker per upstream node. Cloning shares the underlying state.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
    listeners: Arc<Mutex<Vec<StateChangeListener>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, inner: Arc::new(Mutex::new(Inner::new())), listeners: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Registered listeners receive `(newState, reason)` on every transition.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(CircuitState, &str) + Send + Sync + 'static,
    {
        self.listeners.lock().expect("circuit breaker listener lock poisoned").push(Arc::new(listener));
    }

    /// HALF_OPEN admits a single probe request; OPEN admits none until the
    /// retry timeout elapses, at which point it transitions to HALF_OPEN and
    /// admits that one probe.
    pub fn allow_request(&self) -> bool {
        let now = Instant::now();
        let (result, transition) = {
            let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
            match guard.state {
                CircuitState::Closed => (true, None),
                CircuitState::HalfOpen => (false, None),
                CircuitState::Open => {
                    let elapsed = guard.opened_at.map(|at| now.duration_since(at)).unwrap_or_default();
                    if elapsed >= self.config.retry_timeout {
                        let transition = self.transition_locked(
                            &mut guard,
                            CircuitState::HalfOpen,
                            "retry timeout elapsed, probing",
                        );
                        (true, transition)
                    } else {
                        (false, None)
                    }
                },
            }
        };
        self.notify(transition);
        result
    }

    pub fn record_success(&self, latency: Duration) {
        let now = Instant::now();
        let transition = {
            let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
            guard.consecutive_failures = 0;
            guard.samples.push_back(Sample { at: now, latency_ms: latency.as_secs_f64() * 1000.0 });
            guard.prune(now, self.config.latency_window);
            self.update_slow_counter(&mut guard, latency);

            match guard.state {
                CircuitState::HalfOpen => {
                    guard.consecutive_successes += 1;
                    if self.latency_tripped(&guard) {
                        self.transition_locked(
                            &mut guard,
                            CircuitState::Open,
                            "latency threshold exceeded during half-open probe",
                        )
                    } else if guard.consecutive_successes >= self.config.success_threshold {
                        self.transition_locked(&mut guard, CircuitState::Closed, "success threshold met")
                    } else {
                        None
                    }
                },
                CircuitState::Closed => {
                    if self.latency_tripped(&guard) {
                        self.transition_locked(
                            &mut guard,
                            CircuitState::Open,
                            "latency threshold exceeded: consecutive slow requests",
                        )
                    } else {
                        None
                    }
                },
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    pub fn record_failure(&self) {
        let transition = {
            let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
            guard.consecutive_successes = 0;
            guard.consecutive_slow = 0;

            match guard.state {
                CircuitState::HalfOpen => {
                    self.transition_locked(&mut guard, CircuitState::Open, "probe request failed")
                },
                CircuitState::Closed => {
                    guard.consecutive_failures += 1;
                    if guard.consecutive_failures >= self.config.failure_threshold {
                        self.transition_locked(&mut guard, CircuitState::Open, "failure threshold exceeded")
                    } else {
                        None
                    }
                },
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Records a bare latency sample into the rolling window without
    /// touching the failure/success counters. Rejects non-positive values.
    pub fn record_latency(&self, latency_ms: f64) -> bool {
        if latency_ms <= 0.0 {
            return false;
        }
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
        guard.samples.push_back(Sample { at: now, latency_ms });
        guard.prune(now, self.config.latency_window);
        self.update_slow_counter(&mut guard, Duration::from_secs_f64(latency_ms / 1000.0));
        true
    }

    /// Whether the latency trigger is enabled and `consecutiveHighLatency`
    /// has reached the configured threshold.
    pub fn check_latency_threshold(&self) -> bool {
        let guard = self.inner.lock().expect("circuit breaker state lock poisoned");
        self.latency_tripped(&guard)
    }

    /// Forces the breaker back to CLOSED and clears counters and samples,
    /// notifying listeners only if the state actually changed.
    pub fn reset(&self) {
        let transition = {
            let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
            let was = guard.state;
            *guard = Inner::new();
            if was != CircuitState::Closed { Some((CircuitState::Closed, "manual reset")) } else { None }
        };
        self.notify(transition);
    }

    fn update_slow_counter(&self, guard: &mut Inner, latency: Duration) {
        if self.config.latency_trigger_enabled() && latency >= self.config.latency_threshold {
            guard.consecutive_slow += 1;
        } else {
            guard.consecutive_slow = 0;
        }
    }

    fn latency_tripped(&self, guard: &Inner) -> bool {
        self.config.latency_trigger_enabled() && guard.consecutive_slow >= self.config.latency_consecutive_checks
    }

    /// Applies the transition to locked state and reports `(newState,
    /// reason)` for the caller to announce once the lock is released.
    fn transition_locked(
        &self,
        guard: &mut Inner,
        to: CircuitState,
        reason: &'static str,
    ) -> Option<(CircuitState, &'static str)> {
        if guard.state == to {
            return None;
        }
        guard.state = to;
        guard.consecutive_failures = 0;
        guard.consecutive_successes = 0;
        guard.consecutive_slow = 0;
        if to == CircuitState::Open {
            guard.opened_at = Some(Instant::now());
            guard.opened_at_wall = Some(chrono::Utc::now());
        } else {
            guard.opened_at = None;
            guard.opened_at_wall = None;
        }
        Some((to, reason))
    }

    /// Invokes state-change listeners; callers must have already released
    /// the state lock so a listener calling back into this breaker cannot
    /// deadlock.
    fn notify(&self, transition: Option<(CircuitState, &'static str)>) {
        let Some((state, reason)) = transition else { return };
        let listeners = self.listeners.lock().expect("circuit breaker listener lock poisoned").clone();
        for listener in listeners {
            listener(state, reason);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker state lock poisoned").state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("circuit breaker state lock poisoned");
        guard.prune(now, self.config.latency_window);

        let mut latencies: Vec<f64> = guard.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let avg = if latencies.is_empty() { 0.0 } else { latencies.iter().sum::<f64>() / latencies.len() as f64 };
        let min = latencies.first().copied().unwrap_or(0.0);
        let max = latencies.last().copied().unwrap_or(0.0);

        let next_attempt = guard.opened_at_wall.map(|opened_at| {
            let retry = chrono::Duration::from_std(self.config.retry_timeout).unwrap_or_default();
            (opened_at + retry).to_rfc3339()
        });

        CircuitMetrics {
            state: guard.state,
            failure_count: guard.consecutive_failures,
            success_count: guard.consecutive_successes,
            avg_latency_ms: round2(avg),
            latency_samples: latencies.len(),
            min_latency_ms: round2(min),
            max_latency_ms: round2(max),
            p50_latency_ms: round2(percentile(&latencies, 0.50)),
            p95_latency_ms: round2(percentile(&latencies, 0.95)),
            p99_latency_ms: round2(percentile(&latencies, 0.99)),
            consecutive_high_latency: guard.consecutive_slow,
            next_attempt,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Linear-interpolation percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            retry_timeout: Duration::from_millis(20),
            latency_threshold: Duration::from_millis(100),
            latency_consecutive_checks: 2,
            latency_window: Duration::from_secs(60),
        }
    }

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn failure_threshold_trips_open() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_open_after_retry_timeout_then_closes_on_success_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // half-open admits exactly one probe until it resolves
        assert!(!breaker.allow_request());

        breaker.record_success(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn sustained_latency_trips_open_without_explicit_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_success(Duration::from_millis(150));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_success(Duration::from_millis(150));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn zero_latency_threshold_disables_the_latency_trigger() {
        let mut config = fast_config();
        config.latency_threshold = Duration::ZERO;
        let breaker = CircuitBreaker::new(config);
        for _ in 0..10 {
            breaker.record_success(Duration::from_millis(500));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().consecutive_high_latency, 0);
    }

    #[test]
    fn percentiles_reflect_recorded_latencies() {
        let breaker = CircuitBreaker::new(fast_config());
        for ms in [10, 20, 30, 40, 50] {
            breaker.record_success(Duration::from_millis(ms));
        }
        let metrics = breaker.metrics();
        assert_eq!(metrics.latency_samples, 5);
        assert!((metrics.p50_latency_ms - 30.0).abs() < 1.0);
        assert!(metrics.p99_latency_ms >= metrics.p50_latency_ms);
        assert_eq!(metrics.min_latency_ms, 10.0);
        assert_eq!(metrics.max_latency_ms, 50.0);
    }

    #[test]
    fn metrics_are_rounded_to_two_decimals() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_success(Duration::from_micros(10_333));
        let metrics = breaker.metrics();
        let rounded = round2(metrics.avg_latency_ms);
        assert_eq!(metrics.avg_latency_ms, rounded);
    }

    #[test]
    fn open_state_carries_an_iso8601_next_attempt_closed_carries_none() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(breaker.metrics().next_attempt.is_none());
        for _ in 0..3 {
            breaker.record_failure();
        }
        let next_attempt = breaker.metrics().next_attempt.expect("open breaker has a next attempt");
        assert!(chrono::DateTime::parse_from_rfc3339(&next_attempt).is_ok());
    }

    #[test]
    fn state_change_listener_fires_with_reason_outside_the_lock() {
        let breaker = CircuitBreaker::new(fast_config());
        let seen: Arc<Mutex<Vec<(CircuitState, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        breaker.on_state_change(move |state, reason| {
            seen_clone.lock().unwrap().push((state, reason.to_string()));
        });
        for _ in 0..3 {
            breaker.record_failure();
        }
        let events = seen.lock().unwrap();
        let (state, reason) = events.last().unwrap();
        assert_eq!(*state, CircuitState::Open);
        assert!(reason.contains("failure"));
    }

    #[test]
    fn latency_trip_reason_mentions_latency() {
        let breaker = CircuitBreaker::new(fast_config());
        let seen: Arc<Mutex<Vec<(CircuitState, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        breaker.on_state_change(move |state, reason| {
            seen_clone.lock().unwrap().push((state, reason.to_string()));
        });
        breaker.record_success(Duration::from_millis(150));
        breaker.record_success(Duration::from_millis(150));
        let events = seen.lock().unwrap();
        let (state, reason) = events.last().unwrap();
        assert_eq!(*state, CircuitState::Open);
        assert!(reason.contains("latency"));
    }

    #[test]
    fn record_latency_rejects_non_positive_values() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(!breaker.record_latency(0.0));
        assert!(!breaker.record_latency(-5.0));
        assert!(breaker.record_latency(12.5));
        assert_eq!(breaker.metrics().latency_samples, 1);
    }

    #[test]
    fn reset_returns_an_open_breaker_to_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failure_count, 0);
    }
}
