//! Circuit breaker state machine
//!
//! The breaker keeps its whole mutable state (phase, counts, generation and
//! the half-open probe counter) behind a single lock. The lock is never held
//! while the guarded operation runs: a call is admitted under the lock, runs
//! unlocked, and reports its outcome against the generation it was admitted
//! in. Outcomes from an older generation are discarded.
//!
//! ```text
//! Closed ──[ready_to_trip(counts)]──> Open
//!   ▲                                   │
//!   │                                   │ [timeout elapsed]
//!   │                                   ▼
//!   └──[max_requests successes]── HalfOpen ──[any failure]──> Open
//! ```

use crate::{
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    clock::Clock,
    errors::CircuitError,
    probe::ProbePermit,
    whitelist::PathWhitelist,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

/// Seconds the breaker stays open when `timeout_secs` is 0
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Half-open probes allowed when `max_requests` is 0
pub const DEFAULT_MAX_REQUESTS: u32 = 1;

/// Default trip rule: more than this many consecutive failures
pub const DEFAULT_CONSECUTIVE_FAILURES: u32 = 5;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::HalfOpen => "HalfOpen",
            State::Open => "Open",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request outcomes tallied within one generation
///
/// At most one of the consecutive counters is non-zero, and `requests`
/// always equals `total_successes + total_failures`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

pub type ReadyToTripFn = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Default trip rule
pub fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.consecutive_failures > DEFAULT_CONSECUTIVE_FAILURES
}

/// Circuit breaker configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,

    /// Inactive breakers never engage; calls go straight to the transport
    pub active: bool,

    /// Seconds spent Open before probing (0 = 60)
    pub timeout_secs: u64,

    /// Seconds between Closed-state count resets (0 = never)
    pub interval_timeout_secs: u64,

    /// Concurrent probes allowed while HalfOpen (0 = 1)
    pub max_requests: u32,

    /// Exact URL paths the breaker guards; empty means it never engages
    pub paths: Vec<String>,

    /// Jitter factor for the open timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Trip rule evaluated after every Closed-state failure
    #[serde(skip)]
    pub ready_to_trip: Option<ReadyToTripFn>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            interval_timeout_secs: 0,
            max_requests: DEFAULT_MAX_REQUESTS,
            paths: Vec::new(),
            jitter_factor: 0.0,
            ready_to_trip: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn effective_timeout_secs(&self) -> f64 {
        if self.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS as f64
        } else {
            self.timeout_secs as f64
        }
    }

    pub fn effective_max_requests(&self) -> u32 {
        if self.max_requests == 0 {
            DEFAULT_MAX_REQUESTS
        } else {
            self.max_requests
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("active", &self.active)
            .field("timeout_secs", &self.timeout_secs)
            .field("interval_timeout_secs", &self.interval_timeout_secs)
            .field("max_requests", &self.max_requests)
            .field("paths", &self.paths)
            .field("jitter_factor", &self.jitter_factor)
            .field("ready_to_trip", &self.ready_to_trip.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Copy)]
struct OpenData {
    opened_at: f64,
    cooldown_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Copy, Default)]
struct HalfOpenData {
    in_flight: u32,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open(OpenData),
    HalfOpen(HalfOpenData),
}

impl Phase {
    fn state(&self) -> State {
        match self {
            Phase::Closed => State::Closed,
            Phase::Open(_) => State::Open,
            Phase::HalfOpen(_) => State::HalfOpen,
        }
    }
}

/// Everything the lock protects
#[derive(Debug)]
struct Core {
    phase: Phase,
    counts: Counts,
    generation: u64,
    /// Next periodic count reset while Closed
    interval_expiry: Option<f64>,
}

type Transition = (State, State);

/// Circuit breaker public API
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    whitelist: PathWhitelist,
    clock: Arc<dyn Clock>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Create a circuit breaker from parts validated by the builder
    pub(crate) fn from_parts(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        let whitelist = PathWhitelist::new(config.paths.iter().cloned());
        let now = clock.monotonic_time();
        let core = Core {
            phase: Phase::Closed,
            counts: Counts::default(),
            generation: 0,
            interval_expiry: interval_expiry(&config, now),
        };

        Self {
            config,
            whitelist,
            clock,
            failure_classifier,
            callbacks,
            core: Mutex::new(core),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn whitelist(&self) -> &PathWhitelist {
        &self.whitelist
    }

    /// Whether a request to `target` goes through this breaker
    ///
    /// Requires the breaker to be active and the path component of
    /// `target` to be whitelisted.
    pub fn engages(&self, target: &str) -> bool {
        self.config.active && self.whitelist.matches(target)
    }

    /// Execute an async operation with circuit breaker protection
    ///
    /// Rejected calls never run `f`. If the returned future is dropped before
    /// `f` completes, the half-open slot is released without recording an
    /// outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = self.admit().map_err(|rejection| rejection.widen::<E>())?;
        let start = self.clock.monotonic_time();

        match f().await {
            Ok(val) => {
                permit.success();
                Ok(val)
            }
            Err(e) => {
                let duration = self.clock.monotonic_time() - start;
                if self.is_failure(&e, duration) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(CircuitError::Execution(e))
            }
        }
    }

    /// Ask for permission to run one call (two-step API)
    ///
    /// The returned permit must be settled with [`ProbePermit::success`] or
    /// [`ProbePermit::failure`]; dropping it unsettled only frees the slot.
    pub fn admit(&self) -> Result<ProbePermit<'_>, CircuitError<Infallible>> {
        let now = self.clock.monotonic_time();

        let (admitted, transition) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let transition = self.refresh(core, now);

            let admitted = match &mut core.phase {
                Phase::Open(data) => Err(CircuitError::Open {
                    circuit: self.config.name.clone(),
                    opened_at: data.opened_at,
                }),
                Phase::HalfOpen(data) if data.in_flight >= self.config.effective_max_requests() => {
                    Err(CircuitError::TooManyRequests {
                        circuit: self.config.name.clone(),
                        max_requests: self.config.effective_max_requests(),
                    })
                }
                Phase::HalfOpen(data) => {
                    data.in_flight += 1;
                    Ok(core.generation)
                }
                Phase::Closed => Ok(core.generation),
            };

            (admitted, transition)
        };

        self.notify(transition);

        match admitted {
            Ok(generation) => Ok(ProbePermit::new(self, generation)),
            Err(rejection) => {
                tracing::debug!(circuit = %self.config.name, reason = %rejection, "call rejected");
                Err(rejection)
            }
        }
    }

    /// Record the outcome of a call admitted in `generation`
    ///
    /// `None` releases a half-open slot without counting anything.
    pub(crate) fn settle(&self, generation: u64, outcome: Option<bool>) {
        let now = self.clock.monotonic_time();
        let mut transitions: [Option<Transition>; 2] = [None, None];

        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            transitions[0] = self.refresh(core, now);

            if core.generation != generation {
                tracing::trace!(
                    circuit = %self.config.name,
                    generation,
                    current = core.generation,
                    "discarding outcome from stale generation"
                );
            } else {
                if let Phase::HalfOpen(data) = &mut core.phase {
                    data.in_flight = data.in_flight.saturating_sub(1);
                }

                transitions[1] = match outcome {
                    Some(true) => self.on_success(core, now),
                    Some(false) => self.on_failure(core, now),
                    None => None,
                };
            }
        }

        for transition in transitions {
            self.notify(transition);
        }
    }

    fn on_success(&self, core: &mut Core, now: f64) -> Option<Transition> {
        match core.phase {
            Phase::Closed => {
                core.counts.on_success();
                None
            }
            Phase::HalfOpen(_) => {
                core.counts.on_success();
                if core.counts.consecutive_successes >= self.config.effective_max_requests() {
                    self.set_state(core, State::Closed, now)
                } else {
                    None
                }
            }
            Phase::Open(_) => None,
        }
    }

    fn on_failure(&self, core: &mut Core, now: f64) -> Option<Transition> {
        match core.phase {
            Phase::Closed => {
                core.counts.on_failure();
                if self.ready_to_trip(&core.counts) {
                    self.set_state(core, State::Open, now)
                } else {
                    None
                }
            }
            Phase::HalfOpen(_) => self.set_state(core, State::Open, now),
            Phase::Open(_) => None,
        }
    }

    /// Apply time-driven changes: interval resets and Open -> HalfOpen
    fn refresh(&self, core: &mut Core, now: f64) -> Option<Transition> {
        match core.phase {
            Phase::Closed => {
                if let Some(expiry) = core.interval_expiry
                    && expiry <= now
                {
                    self.new_generation(core, now);
                }
                None
            }
            Phase::Open(data) => {
                if now - data.opened_at >= data.cooldown_secs {
                    self.set_state(core, State::HalfOpen, now)
                } else {
                    None
                }
            }
            Phase::HalfOpen(_) => None,
        }
    }

    fn set_state(&self, core: &mut Core, to: State, now: f64) -> Option<Transition> {
        let from = core.phase.state();
        if from == to {
            return None;
        }

        core.phase = match to {
            State::Closed => Phase::Closed,
            State::Open => Phase::Open(OpenData {
                opened_at: now,
                cooldown_secs: self.cooldown_secs(),
            }),
            State::HalfOpen => Phase::HalfOpen(HalfOpenData::default()),
        };
        self.new_generation(core, now);

        tracing::info!(
            circuit = %self.config.name,
            from = %from,
            to = %to,
            generation = core.generation,
            "circuit state changed"
        );

        Some((from, to))
    }

    fn new_generation(&self, core: &mut Core, now: f64) {
        core.generation = core.generation.wrapping_add(1);
        core.counts.clear();
        core.interval_expiry = match core.phase {
            Phase::Closed => interval_expiry(&self.config, now),
            _ => None,
        };
    }

    /// Open-state duration, drawn once per trip
    fn cooldown_secs(&self) -> f64 {
        let timeout_secs = self.config.effective_timeout_secs();

        // Apply jitter using chrono-machines if jitter_factor > 0
        if self.config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: (timeout_secs * 1000.0) as u64,
                multiplier: 1.0,
                max_delay_ms: (timeout_secs * 1000.0) as u64,
            };
            let timeout_ms = policy.calculate_delay(1, self.config.jitter_factor);
            (timeout_ms as f64) / 1000.0
        } else {
            timeout_secs
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        match &self.config.ready_to_trip {
            Some(predicate) => predicate(counts),
            None => default_ready_to_trip(counts),
        }
    }

    fn is_failure<E: 'static>(&self, error: &E, duration: f64) -> bool {
        match &self.failure_classifier {
            Some(classifier) => classifier.is_failure(&FailureContext {
                circuit_name: &self.config.name,
                error: error as &dyn std::any::Any,
                duration,
            }),
            None => true,
        }
    }

    fn notify(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            self.callbacks.trigger(&self.config.name, from, to);
        }
    }

    /// Current state, after applying any elapsed timeout
    pub fn state(&self) -> State {
        let now = self.clock.monotonic_time();
        let (state, transition) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let transition = self.refresh(core, now);
            (core.phase.state(), transition)
        };
        self.notify(transition);
        state
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Snapshot of the current generation's counts
    pub fn counts(&self) -> Counts {
        self.core.lock().counts
    }

    pub fn generation(&self) -> u64 {
        self.core.lock().generation
    }

    /// Probes currently running while HalfOpen (0 in any other state)
    pub fn in_flight(&self) -> u32 {
        match self.core.lock().phase {
            Phase::HalfOpen(data) => data.in_flight,
            _ => 0,
        }
    }
}

fn interval_expiry(config: &CircuitBreakerConfig, now: f64) -> Option<f64> {
    (config.interval_timeout_secs > 0).then(|| now + config.interval_timeout_secs as f64)
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("failure_classifier", &self.failure_classifier)
            .field("callbacks", &self.callbacks)
            .field("core", &*self.core.lock())
            .finish()
    }
}
