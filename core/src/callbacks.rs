//! Callback system for circuit breaker state transitions

use crate::circuit::State;
use std::sync::Arc;

pub type StateChangeFn = Arc<dyn Fn(&str, State, State) + Send + Sync>;
pub type StateEnteredFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_state_change: Option<StateChangeFn>,
    pub on_open: Option<StateEnteredFn>,
    pub on_close: Option<StateEnteredFn>,
    pub on_half_open: Option<StateEnteredFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify listeners of a committed transition
    pub fn trigger(&self, circuit: &str, from: State, to: State) {
        if let Some(ref callback) = self.on_state_change {
            callback(circuit, from, to);
        }

        let entered = match to {
            State::Open => &self.on_open,
            State::Closed => &self.on_close,
            State::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = entered {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
