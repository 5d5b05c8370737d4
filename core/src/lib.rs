//! rest-breaker - HTTP request executor guarded by a circuit breaker
//!
//! This crate provides:
//! - A circuit breaker state machine (Closed → Open → HalfOpen) driven by
//!   rolling counts, with generation tracking so stale outcomes are dropped
//! - A request executor that injects a correlation id, gates whitelisted
//!   paths through the breaker, and buffers every response body
//! - Before/after request hooks that fire exactly once per call
//! - A response envelope decoded on demand, any number of times
//!
//! # Example
//!
//! ```rust,no_run
//! use rest_breaker::{
//!     CircuitBreaker, ReqwestTransport, RequestContext, RestClient, TracingHook, TransportConfig,
//! };
//! use reqwest::header::HeaderMap;
//!
//! # async fn run() -> rest_breaker::Result<()> {
//! let transport = ReqwestTransport::new(&TransportConfig::default())?;
//! let client = RestClient::builder(transport)
//!     .circuit_breaker(
//!         CircuitBreaker::builder("payments")
//!             .active(true)
//!             .path("/v1/charges")
//!             .on_open(|name| println!("Circuit {} opened!", name)),
//!     )
//!     .hook(TracingHook::default())
//!     .build()?;
//!
//! let envelope = client
//!     .get(
//!         &RequestContext::new(),
//!         "req-42",
//!         "https://api.example.com/v1/charges",
//!         HeaderMap::new(),
//!     )
//!     .await?;
//! let charges: serde_json::Value = envelope.json()?;
//! # let _ = charges;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod context;
pub mod curl;
pub mod envelope;
pub mod errors;
pub mod executor;
pub mod hooks;
pub mod http_client;
pub mod mirror;
pub mod probe;
pub mod transport;
pub mod whitelist;

pub use builder::CircuitBuilder;
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, Counts, State};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ClientConfig;
pub use context::RequestContext;
pub use envelope::ResponseEnvelope;
pub use errors::{BoxError, CircuitError, Error, Result};
pub use executor::{
    CORRELATION_ID_HEADER, HttpRequester, RestClient, RestClientBuilder, RoundTripFailure,
};
pub use hooks::{Hook, HookData, HookDispatcher, NoopHook, TracingHook};
pub use http_client::{ReqwestTransport, TransportConfig};
pub use mirror::{HttpRequestMirror, MirrorBody, ResponseRaw};
pub use probe::ProbePermit;
pub use transport::{
    BufferedBody, FnTransport, HttpRequest, ResponseBody, Transport, TransportError,
    TransportErrorKind, TransportFailure, TransportResponse, TransportResult,
};
pub use whitelist::PathWhitelist;
