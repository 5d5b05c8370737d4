//! Error types for circuit breaker and request execution

use crate::envelope::ResponseEnvelope;
use crate::transport::TransportError;
use reqwest::StatusCode;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during circuit breaker operations
#[derive(Debug)]
pub enum CircuitError<E = BoxError> {
    /// Circuit is open, calls are being rejected
    Open { circuit: String, opened_at: f64 },
    /// Half-open probe limit has been reached
    TooManyRequests { circuit: String, max_requests: u32 },
    /// The wrapped operation failed
    Execution(E),
}

impl CircuitError<Infallible> {
    /// Re-type a rejection so it fits any operation's error type
    pub fn widen<E>(self) -> CircuitError<E> {
        match self {
            CircuitError::Open { circuit, opened_at } => CircuitError::Open { circuit, opened_at },
            CircuitError::TooManyRequests {
                circuit,
                max_requests,
            } => CircuitError::TooManyRequests {
                circuit,
                max_requests,
            },
            CircuitError::Execution(never) => match never {},
        }
    }
}

impl<E> CircuitError<E> {
    /// True when the breaker refused the call without running it
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitError::Execution(_))
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { circuit, opened_at } => {
                write!(f, "Circuit '{}' is open (opened at {})", circuit, opened_at)
            }
            CircuitError::TooManyRequests {
                circuit,
                max_requests,
            } => {
                write!(
                    f,
                    "Circuit '{}' half-open probe limit reached (max: {})",
                    circuit, max_requests
                )
            }
            CircuitError::Execution(e) => write!(f, "Circuit execution failed: {}", e),
        }
    }
}

impl<E: StdError + 'static> StdError for CircuitError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors returned by the request executor and response envelope
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport gave up waiting for the server (client timeout or context deadline)
    #[error("Client.Timeout exceeded while awaiting headers")]
    Timeout,

    #[error("circuit breaker '{circuit}' is open")]
    CircuitOpen { circuit: String },

    #[error("circuit breaker '{circuit}' rejected the request: too many requests")]
    TooManyRequests { circuit: String },

    #[error("fail parse url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid value for header {name}")]
    InvalidHeader {
        name: &'static str,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },

    /// Network-level failure; `response` is set when the transport returned one anyway
    #[error("error response from transport: {source}")]
    Transport {
        #[source]
        source: TransportError,
        response: Option<Box<ResponseEnvelope>>,
    },

    /// The round trip succeeded but the server answered with a 5xx status
    #[error("error request http status: {}", status.as_u16())]
    ServerError {
        status: StatusCode,
        response: Box<ResponseEnvelope>,
    },

    /// The transport returned neither a response nor an error
    #[error("transport returned neither a response nor an error")]
    NilResponse,

    #[error("error read body response: {source}")]
    BodyRead {
        #[source]
        source: TransportError,
    },

    #[error("response envelope is nil")]
    NilEnvelope,

    #[error("response body is nil")]
    EmptyBody,

    #[error("decode response body: {0}")]
    Decode(#[source] BoxError),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the circuit breaker refused the call without reaching the transport
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. } | Error::TooManyRequests { .. }
        )
    }

    /// The buffered response that came back alongside this error, if any
    pub fn response(&self) -> Option<&ResponseEnvelope> {
        match self {
            Error::Transport { response, .. } => response.as_deref(),
            Error::ServerError { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<ResponseEnvelope> {
        match self {
            Error::Transport { response, .. } => response.map(|r| *r),
            Error::ServerError { response, .. } => Some(*response),
            _ => None,
        }
    }

    /// HTTP status of the attached response, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::ServerError { status, .. } => Some(*status),
            other => other.response().and_then(ResponseEnvelope::status),
        }
    }
}
