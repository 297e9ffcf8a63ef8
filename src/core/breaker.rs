//! Per-service circuit breaker.
//!
//! The state machine is deliberately small and free of I/O: transitions are
//! driven only by the current state, an outcome event, and the clock passed
//! in by the caller, which keeps it unit-testable without any network
//! dependency.
//!
//! States:
//! - `Closed`: outcomes feed a sliding window of the most recent calls; the
//!   breaker opens when the failure ratio over at least `min_samples`
//!   outcomes exceeds `failure_ratio`.
//! - `Open`: every acquire fails fast until `cooldown` has elapsed.
//! - `HalfOpen`: exactly one probe call is in flight; concurrent acquires
//!   fail fast. Probe success closes the breaker, probe failure re-opens it
//!   and restarts the cooldown.
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::{
    config::models::BreakerConfig,
    core::error::{DispatchError, DispatchResult},
};

/// Result of one upstream call, as seen by the breaker.
/// Timeouts and transport errors are failures; so are 5xx responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Breaker thresholds with the cooldown pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub window_size: usize,
    pub failure_ratio: f64,
    pub min_samples: usize,
    pub cooldown: Duration,
}

impl BreakerSettings {
    pub fn resolve(config: &BreakerConfig) -> Result<Self, String> {
        Ok(Self {
            window_size: config.window_size,
            failure_ratio: config.failure_ratio,
            min_samples: config.min_samples,
            cooldown: config.cooldown_duration()?,
        })
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::resolve(&BreakerConfig::default()).expect("default breaker config parses")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_started: Instant },
}

/// Permission to contact the upstream. `probe` marks the single half-open
/// trial call; its outcome alone decides the half-open transition.
#[derive(Debug)]
pub struct BreakerPermit {
    probe: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// The per-service breaker state machine.
#[derive(Debug)]
pub struct BreakerCore {
    state: CircuitState,
    /// Most recent outcomes, oldest first; `true` marks a failure.
    window: VecDeque<bool>,
    failures: usize,
}

impl BreakerCore {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            failures: 0,
        }
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }

    /// Ask permission to contact the upstream.
    ///
    /// May transition Open -> HalfOpen when the cooldown has elapsed. A probe
    /// whose outcome was never recorded (caller cancelled mid-flight) is
    /// considered lost after a full cooldown and a new probe is issued.
    pub fn try_acquire(
        &mut self,
        settings: &BreakerSettings,
        now: Instant,
    ) -> Option<BreakerPermit> {
        match self.state {
            CircuitState::Closed => Some(BreakerPermit { probe: false }),
            CircuitState::Open { since } => {
                if now.saturating_duration_since(since) >= settings.cooldown {
                    self.state = CircuitState::HalfOpen { probe_started: now };
                    Some(BreakerPermit { probe: true })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen { probe_started } => {
                if now.saturating_duration_since(probe_started) >= settings.cooldown {
                    self.state = CircuitState::HalfOpen { probe_started: now };
                    Some(BreakerPermit { probe: true })
                } else {
                    None
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`try_acquire`].
    ///
    /// Outcomes from calls admitted before a transition (stragglers) are
    /// dropped in Open and HalfOpen so they cannot flip the circuit.
    pub fn record(
        &mut self,
        permit: BreakerPermit,
        outcome: Outcome,
        settings: &BreakerSettings,
        now: Instant,
    ) {
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(outcome, settings.window_size);
                if self.should_trip(settings) {
                    self.window.clear();
                    self.failures = 0;
                    self.state = CircuitState::Open { since: now };
                }
            }
            CircuitState::HalfOpen { .. } if permit.is_probe() => match outcome {
                Outcome::Success => {
                    self.window.clear();
                    self.failures = 0;
                    self.state = CircuitState::Closed;
                }
                Outcome::Failure => {
                    self.state = CircuitState::Open { since: now };
                }
            },
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    fn push_outcome(&mut self, outcome: Outcome, window_size: usize) {
        if self.window.len() == window_size {
            if self.window.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
        let failed = outcome == Outcome::Failure;
        self.window.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn should_trip(&self, settings: &BreakerSettings) -> bool {
        let samples = self.window.len();
        if samples < settings.min_samples {
            return false;
        }
        self.failures as f64 / samples as f64 > settings.failure_ratio
    }
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent map of breakers, one per service, created on first dispatch.
///
/// Each breaker sits behind its own mutex; acquiring and recording for one
/// service never blocks traffic to another. Critical sections are short and
/// never span the upstream call. State persists for the process lifetime;
/// settings are passed per call so reloads change thresholds without
/// resetting windows.
pub struct BreakerMap {
    breakers: HashMap<String, Mutex<BreakerCore>>,
}

impl BreakerMap {
    pub fn new() -> Self {
        Self {
            breakers: HashMap::new(),
        }
    }

    /// Acquire permission to call `service`, or fail fast with `CircuitOpen`.
    pub async fn try_acquire(
        &self,
        service: &str,
        settings: &BreakerSettings,
        now: Instant,
    ) -> DispatchResult<BreakerPermit> {
        let entry = self
            .breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Mutex::new(BreakerCore::new()));

        let mut core = entry.get().lock().expect("breaker mutex poisoned");
        let before = core.state_label();
        let permit = core.try_acquire(settings, now);
        let after = core.state_label();
        drop(core);

        if before != after {
            tracing::info!(service, from = before, to = after, "circuit transition");
            crate::metrics::record_breaker_transition(service, after);
        }

        permit.ok_or_else(|| DispatchError::CircuitOpen {
            service: service.to_string(),
        })
    }

    /// Record a call outcome for `service`.
    pub async fn record(
        &self,
        service: &str,
        permit: BreakerPermit,
        outcome: Outcome,
        settings: &BreakerSettings,
        now: Instant,
    ) {
        let entry = self
            .breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Mutex::new(BreakerCore::new()));

        let mut core = entry.get().lock().expect("breaker mutex poisoned");
        let before = core.state_label();
        core.record(permit, outcome, settings, now);
        let after = core.state_label();
        drop(core);

        if before != after {
            tracing::warn!(service, from = before, to = after, "circuit transition");
            crate::metrics::record_breaker_transition(service, after);
        }
    }

    /// Current state per service (status endpoint).
    pub fn snapshot(&self) -> Vec<(String, &'static str)> {
        let mut states = Vec::new();
        self.breakers.scan(|service, core| {
            let label = core
                .lock()
                .map(|c| c.state_label())
                .unwrap_or("poisoned");
            states.push((service.clone(), label));
        });
        states
    }
}

impl Default for BreakerMap {
    fn default() -> Self {
        Self::new()
    }
}
