//! Circuit Breakers
//!
//! Per-endpoint failure tracking shared by every run of an engine. When an
//! endpoint's rolling failure rate crosses the configured threshold its
//! circuit opens and calls are rejected locally until the cool-down
//! elapses; then a single trial call decides whether to close or re-open.
//!
//! The map is guarded by one mutex that is only held for constant-size
//! bookkeeping, never across a remote call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Thresholds shared by all circuits of one engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Number of most recent outcomes kept per endpoint.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Outcomes required in the window before the circuit may open.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Failure ratio (0.0-1.0) at or above which the circuit opens.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_cool_down")]
    pub cool_down_ms: u64,
}

fn default_window_size() -> usize {
    10
}

fn default_minimum_calls() -> usize {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_cool_down() -> u64 {
    30_000
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            minimum_calls: default_minimum_calls(),
            failure_rate_threshold: default_failure_rate_threshold(),
            cool_down_ms: default_cool_down(),
        }
    }
}

impl CircuitConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The one trial call of a half-open circuit.
    Trial,
    Rejected,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Circuit {
    state: State,
    /// `true` marks a failure.
    window: VecDeque<bool>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: State::Closed,
            window: VecDeque::new(),
        }
    }

    fn push(&mut self, failed: bool, capacity: usize) {
        self.window.push_back(failed);
        while self.window.len() > capacity.max(1) {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Registry of circuits keyed by service endpoint.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks whether a call to `endpoint` may go out now.
    pub fn admit(&self, endpoint: &str) -> Admission {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            State::Closed => Admission::Allowed,
            State::Open { since } => {
                if since.elapsed() >= self.config.cool_down() {
                    info!("Circuit for '{}' half-open, admitting trial call", endpoint);
                    circuit.state = State::HalfOpen {
                        trial_in_flight: true,
                    };
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Admission::Rejected
                } else {
                    circuit.state = State::HalfOpen {
                        trial_in_flight: true,
                    };
                    Admission::Trial
                }
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(Circuit::new);

        if let State::HalfOpen { .. } = circuit.state {
            info!("Circuit for '{}' closed after successful trial", endpoint);
            circuit.state = State::Closed;
            circuit.window.clear();
        }
        circuit.push(false, self.config.window_size);
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(Circuit::new);

        circuit.push(true, self.config.window_size);

        match circuit.state {
            State::HalfOpen { .. } => {
                warn!("Circuit for '{}' re-opened after failed trial", endpoint);
                circuit.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Closed => {
                let rate = circuit.failure_rate();
                if circuit.window.len() >= self.config.minimum_calls
                    && rate >= self.config.failure_rate_threshold
                {
                    warn!(
                        "Circuit for '{}' opened (failure rate {:.0}% over {} calls)",
                        endpoint,
                        rate * 100.0,
                        circuit.window.len()
                    );
                    circuit.state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    /// Admits a call and ties its outcome to the returned permit.
    ///
    /// `None` means the circuit rejected the call.
    pub fn acquire(self: &Arc<Self>, endpoint: &str) -> Option<CircuitPermit> {
        let trial = match self.admit(endpoint) {
            Admission::Rejected => return None,
            Admission::Allowed => false,
            Admission::Trial => true,
        };
        Some(CircuitPermit {
            breakers: Arc::clone(self),
            endpoint: endpoint.to_string(),
            trial,
            reported: false,
        })
    }

    /// Releases a trial slot whose call never completed.
    pub fn abandon_trial(&self, endpoint: &str) {
        let mut circuits = self.lock();
        if let Some(circuit) = circuits.get_mut(endpoint) {
            if let State::HalfOpen { .. } = circuit.state {
                circuit.state = State::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    pub fn status(&self, endpoint: &str) -> CircuitStatus {
        match self.lock().get(endpoint).map(|c| &c.state) {
            None | Some(State::Closed) => CircuitStatus::Closed,
            Some(State::Open { .. }) => CircuitStatus::Open,
            Some(State::HalfOpen { .. }) => CircuitStatus::HalfOpen,
        }
    }

    /// Forgets all history for `endpoint`, closing its circuit.
    pub fn reset(&self, endpoint: &str) {
        self.lock().remove(endpoint);
    }
}

/// One admitted call to an endpoint.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A trial permit dropped without an outcome
/// (the call was cancelled or its task aborted) frees the half-open slot.
#[derive(Debug)]
#[must_use]
pub struct CircuitPermit {
    breakers: Arc<CircuitBreakers>,
    endpoint: String,
    trial: bool,
    reported: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breakers.record_success(&self.endpoint);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breakers.record_failure(&self.endpoint);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            debug!("Trial call to '{}' abandoned", self.endpoint);
            self.breakers.abandon_trial(&self.endpoint);
        }
    }
}
