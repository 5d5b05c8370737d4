//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitBreakerConfig, Counts, State},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    errors::{Error, Result},
};
use std::sync::Arc;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(CircuitBreakerConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Start from a deserialized configuration
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Enable or disable the breaker for outgoing requests
    pub fn active(mut self, active: bool) -> Self {
        self.config.active = active;
        self
    }

    /// Set how long the circuit stays open before probing (0 = 60s)
    pub fn timeout_secs(mut self, seconds: u64) -> Self {
        self.config.timeout_secs = seconds;
        self
    }

    /// Set the cyclic period for clearing counts while closed (0 = never)
    pub fn interval_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.interval_timeout_secs = seconds;
        self
    }

    /// Set the half-open probe limit (0 = 1)
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    /// Replace the whitelisted paths
    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Add one whitelisted path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.paths.push(path.into());
        self
    }

    /// Set the trip rule evaluated after each closed-state failure
    pub fn ready_to_trip<F>(mut self, f: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.config.ready_to_trip = Some(Arc::new(f));
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Set the time source (defaults to [`MonotonicClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// Errors the classifier declines are recorded as successes. Use this to
    /// tolerate "expected" errors while still tripping on the ones that
    /// signal an unhealthy upstream.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rest_breaker::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.duration > 1.0
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for every state transition
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.callbacks.on_state_change = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker> {
        let jitter = self.config.jitter_factor;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Config(format!(
                "jitter_factor must be within 0.0..=1.0, got {jitter}"
            )));
        }

        if let Some(path) = self.config.paths.iter().find(|p| !p.starts_with('/')) {
            return Err(Error::Config(format!(
                "whitelisted path {path:?} must start with '/'"
            )));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        Ok(CircuitBreaker::from_parts(
            self.config,
            clock,
            self.failure_classifier,
            self.callbacks,
        ))
    }
}

impl std::fmt::Debug for CircuitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("failure_classifier", &self.failure_classifier)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
