//! Caller context: deadline and cancellation for one call

use crate::transport::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation signal propagated to the transport and body read
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Context with no deadline that is never cancelled
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline_at(deadline)
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancellation: token,
        }
    }

    /// Replace the deadline, keeping the cancellation token
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drive `fut` under this context
    ///
    /// Cancellation yields a `Cancelled` transport error, deadline expiry a
    /// `Timeout` one. `fut` is dropped in both cases.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<TransportError>,
    {
        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::timeout("context deadline exceeded").into()),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(TransportError::cancelled().into()),
            result = bounded => result,
        }
    }
}
