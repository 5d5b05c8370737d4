//! Failure classification for breaker outcomes
//!
//! This module provides traits and types for deciding whether an error
//! returned by a guarded call counts as a failure. Errors a classifier
//! declines are recorded as successes, so they reset the consecutive
//! failure streak instead of extending it.

use std::any::Any;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call in seconds
    pub duration: f64,
}

/// Trait for classifying failures
///
/// # Examples
///
/// ```rust
/// use rest_breaker::{FailureClassifier, FailureContext, RoundTripFailure};
///
/// #[derive(Debug)]
/// struct IgnoreTimeouts;
///
/// impl FailureClassifier for IgnoreTimeouts {
///     fn is_failure(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<RoundTripFailure>()
///             .map(|failure| !failure.is_timeout())
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should count toward tripping the circuit
    fn is_failure(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that counts every error as a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn is_failure(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn is_failure(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
