//! Admission permits for the two-step breaker API
//!
//! A permit represents one admitted call. It is settled exactly once: either
//! explicitly with an outcome, or implicitly on drop, which frees a
//! half-open slot without counting anything.

use crate::circuit::CircuitBreaker;

/// Guard for one call admitted by [`CircuitBreaker::admit`]
///
/// This ensures that half-open slots are always released, even if the
/// guarded operation panics or its future is dropped.
#[must_use = "an unsettled permit records no outcome"]
pub struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl<'a> ProbePermit<'a> {
    pub(crate) fn new(breaker: &'a CircuitBreaker, generation: u64) -> Self {
        Self {
            breaker,
            generation,
            settled: false,
        }
    }

    /// Generation the call was admitted in
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.settle(Some(true));
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.settle(Some(false));
    }

    fn settle(&mut self, outcome: Option<bool>) {
        if !self.settled {
            self.settled = true;
            self.breaker.settle(self.generation, outcome);
        }
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        self.settle(None);
    }
}

impl std::fmt::Debug for ProbePermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbePermit")
            .field("circuit", &self.breaker.name())
            .field("generation", &self.generation)
            .field("settled", &self.settled)
            .finish()
    }
}
