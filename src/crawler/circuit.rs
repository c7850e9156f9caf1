//! Per-host circuit breaking
//!
//! Sheds load from failing sites. Each host runs a small state machine:
//! Closed admits everything while tracking a rolling window of outcomes,
//! Open rejects until a reset timeout elapses, HalfOpen admits a limited
//! number of probes and closes again after enough consecutive successes.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Failures below this floor never trip the circuit, whatever the ratio
const MIN_FAILURES_TO_TRIP: usize = 3;

/// Consecutive successes required to close a half-open circuit
const DEFAULT_SUCCESS_TO_CLOSE: u32 = 3;

/// Upper bound on retained success/failure events per host
const DEFAULT_ROLLING_WINDOW: usize = 20;

/// Age past which recorded events stop counting toward the ratio
const DEFAULT_EVENT_EXPIRY: Duration = Duration::from_secs(3600);

/// Circuit state for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Failing too much, requests are rejected
    Open,
    /// Probing whether the host has recovered
    HalfOpen,
}

#[derive(Debug)]
struct HostCircuit {
    state: CircuitState,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    failures: VecDeque<Instant>,
    successes: VecDeque<Instant>,
}

impl HostCircuit {
    fn new(window: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            half_open_successes: 0,
            failures: VecDeque::with_capacity(window),
            successes: VecDeque::with_capacity(window),
        }
    }

    /// Drop events older than the expiry window
    fn expire_events(&mut self, expiry: Duration, now: Instant) {
        let cutoff = now.checked_sub(expiry);
        if let Some(cutoff) = cutoff {
            while self.failures.front().is_some_and(|t| *t < cutoff) {
                self.failures.pop_front();
            }
            while self.successes.front().is_some_and(|t| *t < cutoff) {
                self.successes.pop_front();
            }
        }
    }
}

/// Circuit breaker tracking one circuit per host
#[derive(Debug)]
pub struct CircuitBreaker {
    hosts: RwLock<HashMap<String, HostCircuit>>,
    /// Failure ratio in [0, 1] that trips a closed circuit
    failure_threshold: f64,
    /// How long an open circuit waits before the first probe
    reset_timeout: Duration,
    /// Consecutive half-open successes required to close
    success_required_to_close: u32,
    /// Rolling window size per host
    rolling_window: usize,
    /// Event age-out horizon
    event_expiry: Duration,
}

impl CircuitBreaker {
    /// Create a breaker with the standard window parameters
    pub fn new(failure_threshold: f64, reset_timeout: Duration) -> Self {
        Self::with_params(
            failure_threshold,
            reset_timeout,
            DEFAULT_SUCCESS_TO_CLOSE,
            DEFAULT_ROLLING_WINDOW,
            DEFAULT_EVENT_EXPIRY,
        )
    }

    /// Create a breaker with full control over the window parameters
    pub fn with_params(
        failure_threshold: f64,
        reset_timeout: Duration,
        success_required_to_close: u32,
        rolling_window: usize,
        event_expiry: Duration,
    ) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            failure_threshold,
            reset_timeout,
            success_required_to_close,
            rolling_window,
            event_expiry,
        }
    }

    /// Decide admission for a host. May itself transition the circuit:
    /// an Open circuit whose reset timeout has elapsed moves to HalfOpen
    /// and the caller becomes the first probe.
    pub fn is_allowed(&self, host: &str) -> bool {
        // Fast path: existing circuit in Closed needs no mutation
        {
            let hosts = self.hosts.read();
            match hosts.get(host) {
                Some(circuit) if circuit.state == CircuitState::Closed => return true,
                Some(_) => {}
                None => {}
            }
        }

        let mut hosts = self.hosts.write();
        let circuit = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostCircuit::new(self.rolling_window));

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.reset_timeout {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    tracing::debug!("Circuit for {} is half-open, admitting probe", host);
                    true
                } else {
                    false
                }
            }
            // Admit probes until enough successes have been observed
            CircuitState::HalfOpen => circuit.half_open_successes < self.success_required_to_close,
        }
    }

    /// Record a successful request to the host
    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.write();
        let circuit = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostCircuit::new(self.rolling_window));
        let now = Instant::now();

        match circuit.state {
            CircuitState::Closed => {
                circuit.successes.push_back(now);
                if circuit.successes.len() > self.rolling_window {
                    circuit.successes.pop_front();
                }
                circuit.expire_events(self.event_expiry, now);
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.success_required_to_close {
                    tracing::info!("Circuit for {} closed after successful probes", host);
                    circuit.state = CircuitState::Closed;
                    circuit.opened_at = None;
                    circuit.failures.clear();
                    circuit.successes.push_back(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request to the host. Returns true when this call
    /// tripped the circuit (Closed or HalfOpen transitioned to Open).
    pub fn record_failure(&self, host: &str) -> bool {
        let mut hosts = self.hosts.write();
        let circuit = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostCircuit::new(self.rolling_window));
        let now = Instant::now();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                if circuit.failures.len() > self.rolling_window {
                    circuit.failures.pop_front();
                }
                circuit.expire_events(self.event_expiry, now);

                let failures = circuit.failures.len();
                let total = failures + circuit.successes.len();
                if total > 0 {
                    let failure_rate = failures as f64 / total as f64;
                    if failure_rate >= self.failure_threshold && failures >= MIN_FAILURES_TO_TRIP {
                        tracing::warn!(
                            "Circuit for {} tripped ({}/{} recent requests failed)",
                            host,
                            failures,
                            total
                        );
                        circuit.state = CircuitState::Open;
                        circuit.opened_at = Some(now);
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => {
                // A failed probe reopens immediately
                tracing::warn!("Circuit for {} reopened after failed probe", host);
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Current state for a host; hosts with no traffic are Closed
    pub fn state(&self, host: &str) -> CircuitState {
        self.hosts
            .read()
            .get(host)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset a host's circuit to Closed, clearing its history
    pub fn reset(&self, host: &str) {
        if let Some(circuit) = self.hosts.write().get_mut(host) {
            circuit.state = CircuitState::Closed;
            circuit.opened_at = None;
            circuit.half_open_successes = 0;
            circuit.failures.clear();
            circuit.successes.clear();
        }
    }

    /// Number of hosts whose circuit is currently Open (feeds the
    /// open_circuits gauge)
    pub fn open_count(&self) -> usize {
        self.hosts
            .read()
            .values()
            .filter(|c| c.state == CircuitState::Open)
            .count()
    }

    #[cfg(test)]
    fn event_counts(&self, host: &str) -> (usize, usize) {
        self.hosts
            .read()
            .get(host)
            .map(|c| (c.failures.len(), c.successes.len()))
            .unwrap_or((0, 0))
    }
}
