//! Transport capability consumed by the executor
//!
//! Anything that can turn an [`HttpRequest`] into a response or an error can
//! be plugged in: the reqwest-backed network transport, a closure
//! ([`FnTransport`]), or a hand-written double.

use crate::errors::BoxError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Version};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

/// Outgoing request handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn content_length(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Streaming response body
///
/// The executor reads the body at most once and closes it exactly once.
#[async_trait]
pub trait ResponseBody: Send {
    async fn read_all(&mut self) -> Result<Bytes, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Response returned by a [`Transport`], body not yet read
pub struct TransportResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    /// Declared length, when the server sent one
    pub content_length: Option<u64>,
    pub body: Box<dyn ResponseBody>,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl ResponseBody + 'static) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: None,
            body: Box::new(body),
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// In-memory body with injectable read and close failures
#[derive(Debug, Clone, Default)]
pub struct BufferedBody {
    data: Bytes,
    fail_read: Option<String>,
    fail_close: Option<String>,
    closes: Arc<AtomicUsize>,
}

impl BufferedBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Make `read_all` fail with `message`
    pub fn fail_read(mut self, message: impl Into<String>) -> Self {
        self.fail_read = Some(message.into());
        self
    }

    /// Make `close` fail with `message`
    pub fn fail_close(mut self, message: impl Into<String>) -> Self {
        self.fail_close = Some(message.into());
        self
    }

    /// Shared counter of `close` calls, for asserting exactly-once release
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

#[async_trait]
impl ResponseBody for BufferedBody {
    async fn read_all(&mut self) -> Result<Bytes, TransportError> {
        match &self.fail_read {
            Some(message) => Err(TransportError::body(message.clone())),
            None => Ok(self.data.clone()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match &self.fail_close {
            Some(message) => Err(TransportError::body(message.clone())),
            None => Ok(()),
        }
    }
}

/// What went wrong at the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Client-side deadline exceeded
    Timeout,
    Connect,
    Cancelled,
    Body,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Cancelled => "cancelled",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Other => "other",
        }
    }
}

/// Error raised by a transport or a response body
#[derive(Debug, thiserror::Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "request cancelled")
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Body, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TransportErrorKind::Cancelled
    }
}

/// A failed round trip, optionally with the response the transport still produced
#[derive(Debug)]
pub struct TransportFailure {
    pub error: TransportError,
    pub response: Option<TransportResponse>,
}

impl TransportFailure {
    pub fn with_response(error: TransportError, response: TransportResponse) -> Self {
        Self {
            error,
            response: Some(response),
        }
    }
}

impl From<TransportError> for TransportFailure {
    fn from(error: TransportError) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

/// `Ok(None)` means the transport produced neither a response nor an error
pub type TransportResult = Result<Option<TransportResponse>, TransportFailure>;

/// The single `execute(request) -> response | error` capability
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> TransportResult;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: HttpRequest) -> TransportResult {
        (**self).execute(request).await
    }
}

type BoxFuture = std::pin::Pin<Box<dyn Future<Output = TransportResult> + Send>>;

/// Transport backed by a closure, counting every invocation
pub struct FnTransport {
    handler: Box<dyn Fn(HttpRequest) -> BoxFuture + Send + Sync>,
    calls: Arc<AtomicUsize>,
}

impl FnTransport {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransportResult> + Send + 'static,
    {
        Self {
            handler: Box::new(move |request| Box::pin(handler(request))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transport that answers every request with `status` and `body`
    pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(move |_| {
            let body = BufferedBody::new(body.clone());
            async move { Ok(Some(TransportResponse::new(status, body))) }
        })
    }

    /// Transport that fails every request with an error of `kind`
    pub fn fail(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| {
            let error = TransportError::new(kind, message.clone());
            async move { Err(error.into()) }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared handle to the invocation counter
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn execute(&self, request: HttpRequest) -> TransportResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(request).await
    }
}

impl std::fmt::Debug for FnTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransport")
            .field("handler", &"<closure>")
            .field("calls", &self.calls())
            .finish()
    }
}
