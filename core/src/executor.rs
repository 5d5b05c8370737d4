//! Request executor: correlation header, hooks, breaker gate, body buffering
//!
//! Every verb funnels into [`RestClient::call`]. The before-hook fires once
//! the request is built (or with the error if it could not be). The
//! after-hook fires exactly once per call on every exit path, including a
//! dropped call future.

use crate::{
    builder::CircuitBuilder,
    circuit::CircuitBreaker,
    context::RequestContext,
    curl::render_curl,
    envelope::ResponseEnvelope,
    errors::{CircuitError, Error, Result},
    hooks::{Hook, HookData, HookDispatcher},
    mirror::{HttpRequestMirror, MirrorBody, ResponseRaw},
    transport::{
        HttpRequest, ResponseBody, Transport, TransportError, TransportErrorKind,
        TransportFailure, TransportResponse,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tracing::Instrument;
use url::Url;

/// Header carrying the caller's correlation id on every outgoing request
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Why a round trip counts against the breaker
///
/// This is the error type the breaker sees, so a [`FailureClassifier`]
/// downcasts `FailureContext::error` to it.
///
/// [`FailureClassifier`]: crate::FailureClassifier
#[derive(Debug, thiserror::Error)]
pub enum RoundTripFailure {
    #[error("{error}")]
    Transport {
        error: TransportError,
        response: Option<TransportResponse>,
    },

    /// Round trip completed with a 5xx status
    #[error("error request http status: {}", .0.status.as_u16())]
    ServerError(TransportResponse),

    #[error("transport returned neither a response nor an error")]
    NilResponse,
}

impl RoundTripFailure {
    /// Status of the response that came back, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RoundTripFailure::Transport { response, .. } => response.as_ref().map(|r| r.status),
            RoundTripFailure::ServerError(response) => Some(response.status),
            RoundTripFailure::NilResponse => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RoundTripFailure::Transport { error, .. } if error.is_timeout())
    }
}

type RoundTrip = std::result::Result<TransportResponse, RoundTripFailure>;

/// Error to surface after the body has been buffered
enum Deferred {
    Status(StatusCode),
    Transport(TransportError),
}

/// The five verbs as a substitutable capability
#[async_trait]
pub trait HttpRequester: Send + Sync {
    async fn get(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
    ) -> Result<ResponseEnvelope>;

    async fn post(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope>;

    async fn put(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope>;

    async fn patch(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope>;

    async fn delete(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope>;
}

/// HTTP client guarded by an optional circuit breaker
#[derive(Clone)]
pub struct RestClient {
    transport: Arc<dyn Transport>,
    breaker: Option<Arc<CircuitBreaker>>,
    hooks: HookDispatcher,
}

impl RestClient {
    /// Client without breaker or hooks
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            breaker: None,
            hooks: HookDispatcher::new(),
        }
    }

    pub fn builder(transport: impl Transport + 'static) -> RestClientBuilder {
        RestClientBuilder::new(transport)
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
    ) -> Result<ResponseEnvelope> {
        self.call(ctx, Method::GET, correlation_id, target, headers, Bytes::new())
            .await
    }

    pub async fn post(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<ResponseEnvelope> {
        self.call(ctx, Method::POST, correlation_id, target, headers, body.into())
            .await
    }

    pub async fn put(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<ResponseEnvelope> {
        self.call(ctx, Method::PUT, correlation_id, target, headers, body.into())
            .await
    }

    pub async fn patch(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<ResponseEnvelope> {
        self.call(ctx, Method::PATCH, correlation_id, target, headers, body.into())
            .await
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<ResponseEnvelope> {
        self.call(ctx, Method::DELETE, correlation_id, target, headers, body.into())
            .await
    }

    /// Execute one request
    ///
    /// On a 5xx through the breaker, or a transport error that still came
    /// with a response, the buffered response is attached to the error.
    pub async fn call(
        &self,
        ctx: &RequestContext,
        method: Method,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        let span = tracing::debug_span!(
            "rest.call",
            method = %method,
            url = target,
            correlation_id
        );

        async move {
            let mut after = AfterHook::new(&self.hooks, ctx, target, correlation_id);
            let result = self
                .execute(ctx, &mut after, method, correlation_id, target, headers, body)
                .await;

            if let Err(e) = &result {
                tracing::debug!(error = %e, "call failed");
            }
            after.complete(result.as_ref().err());
            result
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        ctx: &RequestContext,
        after: &mut AfterHook<'_>,
        method: Method,
        correlation_id: &str,
        target: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        match HeaderValue::from_str(correlation_id) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
            }
            Err(source) => {
                let err = Error::InvalidHeader {
                    name: CORRELATION_ID_HEADER,
                    source,
                };
                after.before(Some(&err));
                return Err(err);
            }
        }

        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(source) => {
                let err = Error::InvalidUrl {
                    url: target.to_string(),
                    source,
                };
                after.before(Some(&err));
                return Err(err);
            }
        };

        let request = HttpRequest {
            method,
            url,
            headers,
            body,
        };
        after.curl = render_curl(&request).unwrap_or_default();
        after.request = HttpRequestMirror::from_request(&request);
        after.before(None);

        let (response, deferred) = match self.send(ctx, target, request).await? {
            Ok(response) => (response, None),
            Err(RoundTripFailure::ServerError(response)) => {
                let status = response.status;
                (response, Some(Deferred::Status(status)))
            }
            Err(RoundTripFailure::Transport {
                error,
                response: Some(response),
            }) => (response, Some(Deferred::Transport(error))),
            Err(RoundTripFailure::Transport {
                error,
                response: None,
            }) => return Err(classify(error, None)),
            Err(RoundTripFailure::NilResponse) => return Err(Error::NilResponse),
        };

        let mut raw = ResponseRaw::from_head(
            response.status,
            response.version,
            &response.headers,
            response.content_length,
        );
        after.response = Some(raw.clone());

        let mut body = BodyGuard::new(response.body);
        let read = ctx.run(body.read_all()).await;
        after.body_close_error = body.close();

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(source) => {
                return Err(match source.kind() {
                    TransportErrorKind::Timeout => Error::Timeout,
                    TransportErrorKind::Cancelled => Error::Cancelled,
                    _ => Error::BodyRead { source },
                });
            }
        };

        raw.body = MirrorBody::from_bytes(&bytes);
        after.response = Some(raw.clone());
        let envelope = ResponseEnvelope::new(Some(bytes), after.curl.clone(), raw);

        match deferred {
            None => Ok(envelope),
            Some(Deferred::Status(status)) => Err(Error::ServerError {
                status,
                response: Box::new(envelope),
            }),
            Some(Deferred::Transport(error)) => Err(classify(error, Some(envelope))),
        }
    }

    /// Run the transport, through the breaker when it engages for `target`
    ///
    /// The outer error is a breaker rejection; the transport was not called.
    async fn send(
        &self,
        ctx: &RequestContext,
        target: &str,
        request: HttpRequest,
    ) -> Result<RoundTrip> {
        let breaker = match &self.breaker {
            Some(breaker) if breaker.engages(target) => breaker,
            _ => {
                // Bypass: hand back whatever the transport returned, 5xx included
                return Ok(match ctx.run(self.transport.execute(request)).await {
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => Err(RoundTripFailure::NilResponse),
                    Err(TransportFailure { error, response }) => {
                        Err(RoundTripFailure::Transport { error, response })
                    }
                });
            }
        };

        let result = breaker
            .call(move || async move {
                match ctx.run(self.transport.execute(request)).await {
                    Ok(Some(response)) if response.is_server_error() => {
                        Err(RoundTripFailure::ServerError(response))
                    }
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => Err(RoundTripFailure::NilResponse),
                    Err(TransportFailure { error, response }) => {
                        Err(RoundTripFailure::Transport { error, response })
                    }
                }
            })
            .await;

        match result {
            Ok(response) => Ok(Ok(response)),
            Err(CircuitError::Execution(failure)) => Ok(Err(failure)),
            Err(CircuitError::Open { circuit, .. }) => Err(Error::CircuitOpen { circuit }),
            Err(CircuitError::TooManyRequests { circuit, .. }) => {
                Err(Error::TooManyRequests { circuit })
            }
        }
    }
}

/// Map a transport error onto the crate taxonomy
fn classify(error: TransportError, response: Option<ResponseEnvelope>) -> Error {
    match error.kind() {
        TransportErrorKind::Timeout if response.is_none() => Error::Timeout,
        TransportErrorKind::Cancelled if response.is_none() => Error::Cancelled,
        _ => Error::Transport {
            source: error,
            response: response.map(Box::new),
        },
    }
}

#[async_trait]
impl HttpRequester for RestClient {
    async fn get(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
    ) -> Result<ResponseEnvelope> {
        RestClient::get(self, ctx, correlation_id, target, headers).await
    }

    async fn post(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        RestClient::post(self, ctx, correlation_id, target, headers, body).await
    }

    async fn put(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        RestClient::put(self, ctx, correlation_id, target, headers, body).await
    }

    async fn patch(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        RestClient::patch(self, ctx, correlation_id, target, headers, body).await
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        correlation_id: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseEnvelope> {
        RestClient::delete(self, ctx, correlation_id, target, headers, body).await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Per-call state for the after-hook; fires on drop if never completed
struct AfterHook<'a> {
    hooks: &'a HookDispatcher,
    ctx: &'a RequestContext,
    url: &'a str,
    correlation_id: &'a str,
    start_time: DateTime<Utc>,
    curl: String,
    request: HttpRequestMirror,
    response: Option<ResponseRaw>,
    body_close_error: Option<String>,
    fired: bool,
}

impl<'a> AfterHook<'a> {
    fn new(
        hooks: &'a HookDispatcher,
        ctx: &'a RequestContext,
        url: &'a str,
        correlation_id: &'a str,
    ) -> Self {
        Self {
            hooks,
            ctx,
            url,
            correlation_id,
            start_time: Utc::now(),
            curl: String::new(),
            request: HttpRequestMirror::default(),
            response: None,
            body_close_error: None,
            fired: false,
        }
    }

    fn data<'b>(
        &'b self,
        error: Option<&'b Error>,
        response: Option<&'b ResponseRaw>,
    ) -> HookData<'b> {
        HookData {
            error,
            url: self.url,
            curl: &self.curl,
            start_time: self.start_time,
            request: &self.request,
            response,
            correlation_id: self.correlation_id,
            body_close_error: self.body_close_error.as_deref(),
        }
    }

    fn before(&self, error: Option<&Error>) {
        self.hooks.before(self.ctx, &self.data(error, None));
    }

    fn complete(mut self, error: Option<&Error>) {
        self.fire(error);
    }

    fn fire(&mut self, error: Option<&Error>) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.hooks
            .after(self.ctx, &self.data(error, self.response.as_ref()));
    }
}

impl Drop for AfterHook<'_> {
    fn drop(&mut self) {
        if !self.fired {
            self.fire(Some(&Error::Cancelled));
        }
    }
}

/// Response body closed exactly once, on drop at the latest
struct BodyGuard {
    body: Option<Box<dyn ResponseBody>>,
}

impl BodyGuard {
    fn new(body: Box<dyn ResponseBody>) -> Self {
        Self { body: Some(body) }
    }

    async fn read_all(&mut self) -> std::result::Result<Bytes, TransportError> {
        match self.body.as_mut() {
            Some(body) => body.read_all().await,
            None => Err(TransportError::body("response body already closed")),
        }
    }

    /// Close the body; the error message is returned for observers
    fn close(&mut self) -> Option<String> {
        let mut body = self.body.take()?;
        match body.close() {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to close response body");
                Some(e.to_string())
            }
        }
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.close();
    }
}

enum BreakerSource {
    Build(CircuitBuilder),
    Shared(Arc<CircuitBreaker>),
}

/// Validated construction of a [`RestClient`]
pub struct RestClientBuilder {
    transport: Arc<dyn Transport>,
    breaker: Option<BreakerSource>,
    hooks: Vec<Option<Arc<dyn Hook>>>,
}

impl RestClientBuilder {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_transport(Arc::new(transport))
    }

    pub fn from_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            breaker: None,
            hooks: Vec::new(),
        }
    }

    /// Guard requests with a breaker built from `builder`
    pub fn circuit_breaker(mut self, builder: CircuitBuilder) -> Self {
        self.breaker = Some(BreakerSource::Build(builder));
        self
    }

    /// Guard requests with a breaker shared with other clients
    pub fn shared_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(BreakerSource::Shared(breaker));
        self
    }

    pub fn hook(self, hook: impl Hook + 'static) -> Self {
        self.hook_arc(Arc::new(hook))
    }

    pub fn hook_arc(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(Some(hook));
        self
    }

    /// Add a hook that may be absent; an absent hook fails `build()`
    pub fn hook_slot(mut self, hook: Option<Arc<dyn Hook>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<RestClient> {
        if self.hooks.iter().any(Option::is_none) {
            return Err(Error::Config("hook is nil".to_string()));
        }

        let breaker = match self.breaker {
            Some(BreakerSource::Build(builder)) => Some(Arc::new(builder.build()?)),
            Some(BreakerSource::Shared(breaker)) => Some(breaker),
            None => None,
        };

        Ok(RestClient {
            transport: self.transport,
            breaker,
            hooks: HookDispatcher::from_slots(self.hooks),
        })
    }
}

impl std::fmt::Debug for RestClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClientBuilder")
            .field("breaker", &self.breaker.is_some())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::State;
    use crate::clock::ManualClock;
    use crate::transport::{BufferedBody, FnTransport};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Event {
        phase: &'static str,
        error: Option<String>,
        status: Option<u16>,
        body_close_error: Option<String>,
    }

    #[derive(Default, Clone)]
    struct RecordingHook {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingHook {
        fn record(&self, phase: &'static str, data: &HookData<'_>) {
            self.events.lock().push(Event {
                phase,
                error: data.error.map(|e| e.to_string()),
                status: data.response.map(|r| r.status_code),
                body_close_error: data.body_close_error.map(str::to_string),
            });
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn phases(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|e| e.phase).collect()
        }
    }

    impl Hook for RecordingHook {
        fn before_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
            self.record("before", data);
        }

        fn after_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
            self.record("after", data);
        }
    }

    fn respond(status: u16, body: &'static str) -> FnTransport {
        FnTransport::respond(StatusCode::from_u16(status).unwrap(), body)
    }

    fn guarded(clock: Arc<ManualClock>) -> CircuitBuilder {
        CircuitBreaker::builder("payments")
            .active(true)
            .path("/pay")
            .clock(clock)
    }

    fn client_with(
        transport: Arc<FnTransport>,
        breaker: Option<CircuitBuilder>,
    ) -> (RestClient, RecordingHook) {
        let hook = RecordingHook::default();
        let mut builder = RestClientBuilder::from_transport(transport).hook(hook.clone());
        if let Some(breaker) = breaker {
            builder = builder.circuit_breaker(breaker);
        }
        (builder.build().unwrap(), hook)
    }

    #[tokio::test]
    async fn test_get_returns_buffered_envelope() {
        let transport = Arc::new(respond(200, r#"{"id": 1}"#));
        let (client, hook) = client_with(transport.clone(), None);

        let envelope = client
            .get(&RequestContext::new(), "corr-1", "http://localhost/orders/1", HeaderMap::new())
            .await
            .unwrap();

        let value: serde_json::Value = envelope.json().unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(envelope.status(), Some(StatusCode::OK));
        assert_eq!(envelope.raw().body, MirrorBody::Json(serde_json::json!({"id": 1})));
        assert_eq!(
            envelope.curl(),
            "curl -X 'GET' -H 'correlation-id: corr-1' 'http://localhost/orders/1'"
        );
        assert_eq!(transport.calls(), 1);

        let events = hook.events();
        assert_eq!(hook.phases(), vec!["before", "after"]);
        assert_eq!(events[0].status, None);
        assert_eq!(events[1].error, None);
        assert_eq!(events[1].status, Some(200));
    }

    #[tokio::test]
    async fn test_correlation_id_and_body_reach_transport() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let transport = FnTransport::new(move |request: HttpRequest| {
            seen_clone.lock().push((
                request.method.clone(),
                request.headers.get(CORRELATION_ID_HEADER).cloned(),
                request.body.clone(),
            ));
            async { Ok(Some(TransportResponse::new(StatusCode::OK, BufferedBody::empty()))) }
        });
        let client = RestClient::new(transport);
        let ctx = RequestContext::new();
        let target = "http://localhost/orders";

        client.get(&ctx, "c-get", target, HeaderMap::new()).await.unwrap();
        client.post(&ctx, "c-post", target, HeaderMap::new(), "a").await.unwrap();
        client.put(&ctx, "c-put", target, HeaderMap::new(), "b").await.unwrap();
        client.patch(&ctx, "c-patch", target, HeaderMap::new(), "c").await.unwrap();
        client.delete(&ctx, "c-delete", target, HeaderMap::new(), "").await.unwrap();

        let seen = seen.lock();
        let methods: Vec<_> = seen.iter().map(|(m, _, _)| m.clone()).collect();
        assert_eq!(
            methods,
            vec![Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE]
        );
        assert_eq!(seen[1].1, Some(HeaderValue::from_static("c-post")));
        assert_eq!(seen[2].2, Bytes::from("b"));
        assert!(seen[0].2.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_skips_transport_and_fires_both_hooks() {
        let transport = Arc::new(respond(200, "ok"));
        let (client, hook) = client_with(transport.clone(), None);

        let err = client
            .get(&RequestContext::new(), "corr", "not a url", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidUrl { .. }));
        assert_eq!(transport.calls(), 0);

        let events = hook.events();
        assert_eq!(hook.phases(), vec!["before", "after"]);
        assert!(events[0].error.as_deref().unwrap().starts_with("fail parse url not a url"));
        assert_eq!(events[1].error, events[0].error);
    }

    #[tokio::test]
    async fn test_invalid_correlation_id_is_rejected() {
        let transport = Arc::new(respond(200, "ok"));
        let (client, hook) = client_with(transport.clone(), None);

        let err = client
            .get(&RequestContext::new(), "bad\nid", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidHeader { name: CORRELATION_ID_HEADER, .. }));
        assert_eq!(transport.calls(), 0);
        assert_eq!(hook.phases(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_server_error_through_breaker_returns_response_and_error() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(respond(500, r#"{"error": "boom"}"#));
        let (client, hook) = client_with(transport, Some(guarded(clock)));

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "error request http status: 500");
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        let body: serde_json::Value = err.response().unwrap().json().unwrap();
        assert_eq!(body["error"], "boom");

        let breaker = client.circuit_breaker().unwrap();
        assert_eq!(breaker.counts().total_failures, 1);

        let events = hook.events();
        assert_eq!(events[1].error.as_deref(), Some("error request http status: 500"));
        assert_eq!(events[1].status, Some(500));
    }

    #[tokio::test]
    async fn test_server_error_without_breaker_is_returned_as_is() {
        let transport = Arc::new(respond(503, "unavailable"));
        let (client, hook) = client_with(transport, None);

        let envelope = client
            .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(envelope.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(envelope.body().unwrap(), &Bytes::from("unavailable"));
        assert_eq!(hook.events()[1].error, None);
    }

    #[tokio::test]
    async fn test_timeout_is_normalized() {
        let transport = Arc::new(FnTransport::fail(
            TransportErrorKind::Timeout,
            "Client.Timeout exceeded",
        ));
        let (client, hook) = client_with(transport, None);

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/slow", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.response().is_none());
        assert_eq!(hook.events()[1].error, Some(Error::Timeout.to_string()));
    }

    #[tokio::test]
    async fn test_transport_error_is_wrapped() {
        let transport = Arc::new(FnTransport::fail(
            TransportErrorKind::Connect,
            "connection refused",
        ));
        let (client, _hook) = client_with(transport, None);

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        match err {
            Error::Transport { source, response } => {
                assert_eq!(source.kind(), TransportErrorKind::Connect);
                assert!(response.is_none());
            }
            other => panic!("Expected Error::Transport, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nil_response_is_distinct() {
        let transport = Arc::new(FnTransport::new(|_| async { Ok(None) }));
        let (client, hook) = client_with(transport, None);

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NilResponse));
        assert_eq!(hook.phases(), vec!["before", "after"]);
        assert_eq!(hook.events()[1].error, Some(Error::NilResponse.to_string()));
    }

    #[tokio::test]
    async fn test_transport_error_with_response_keeps_both() {
        let transport = Arc::new(FnTransport::new(|_| async {
            Err(TransportFailure::with_response(
                TransportError::other("stream reset after headers"),
                TransportResponse::new(StatusCode::OK, BufferedBody::new("partial")),
            ))
        }));
        let (client, _hook) = client_with(transport, None);

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport { .. }));
        let envelope = err.into_response().unwrap();
        assert_eq!(envelope.body().unwrap(), &Bytes::from("partial"));
        assert_eq!(envelope.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_body_read_failure_closes_body_once() {
        let body = BufferedBody::new("data").fail_read("connection reset");
        let closes = body.close_counter();
        let transport = Arc::new(FnTransport::new(move |_| {
            let body = body.clone();
            async move { Ok(Some(TransportResponse::new(StatusCode::OK, body))) }
        }));
        let (client, hook) = client_with(transport, None);

        let err = client
            .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BodyRead { .. }));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let events = hook.events();
        assert_eq!(hook.phases(), vec!["before", "after"]);
        assert!(events[1].error.as_deref().unwrap().starts_with("error read body response"));
        assert_eq!(events[1].status, Some(200));
    }

    #[tokio::test]
    async fn test_body_close_failure_does_not_override_result() {
        let body = BufferedBody::new("fine").fail_close("close failed");
        let closes = body.close_counter();
        let transport = Arc::new(FnTransport::new(move |_| {
            let body = body.clone();
            async move { Ok(Some(TransportResponse::new(StatusCode::OK, body))) }
        }));
        let (client, hook) = client_with(transport, None);

        let envelope = client
            .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(envelope.body().unwrap(), &Bytes::from("fine"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let after = &hook.events()[1];
        assert_eq!(after.error, None);
        assert_eq!(after.body_close_error.as_deref(), Some("body error: close failed"));
    }

    #[tokio::test]
    async fn test_success_closes_body_once() {
        let body = BufferedBody::new("ok");
        let closes = body.close_counter();
        let transport = FnTransport::new(move |_| {
            let body = body.clone();
            async move { Ok(Some(TransportResponse::new(StatusCode::OK, body))) }
        });
        let client = RestClient::new(transport);

        for _ in 0..3 {
            client
                .get(&RequestContext::new(), "corr", "http://localhost/", HeaderMap::new())
                .await
                .unwrap();
        }

        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_six_failures_on_whitelisted_path() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(FnTransport::fail(TransportErrorKind::Connect, "refused"));
        let (client, hook) = client_with(transport.clone(), Some(guarded(clock)));
        let ctx = RequestContext::new();

        for _ in 0..6 {
            let err = client
                .get(&ctx, "corr", "http://localhost/pay", HeaderMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Transport { .. }));
        }

        let err = client
            .get(&ctx, "corr", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CircuitOpen { ref circuit } if circuit == "payments"));
        assert!(err.is_rejection());
        assert_eq!(transport.calls(), 6);
        assert_eq!(client.circuit_breaker().unwrap().state(), State::Open);

        // Rejected calls are still observed
        assert_eq!(hook.phases().len(), 14);
    }

    #[tokio::test]
    async fn test_inactive_breaker_is_never_touched() {
        let transport = Arc::new(FnTransport::fail(TransportErrorKind::Connect, "refused"));
        let breaker = CircuitBreaker::builder("payments").path("/pay");
        let (client, _hook) = client_with(transport.clone(), Some(breaker));

        for _ in 0..10 {
            let _ = client
                .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
                .await;
        }

        let breaker = client.circuit_breaker().unwrap();
        assert_eq!(transport.calls(), 10);
        assert_eq!(breaker.counts().requests, 0);
        assert_eq!(breaker.counts().total_failures, 0);
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn test_non_whitelisted_path_bypasses_breaker() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(FnTransport::fail(TransportErrorKind::Connect, "refused"));
        let (client, _hook) = client_with(transport.clone(), Some(guarded(clock)));

        let targets = [
            "http://localhost/pay/refund",
            "http://localhost/",
            "http://localhost/payments",
        ];
        for target in targets {
            for _ in 0..10 {
                let _ = client
                    .get(&RequestContext::new(), "corr", target, HeaderMap::new())
                    .await;
            }
        }

        let breaker = client.circuit_breaker().unwrap();
        assert_eq!(transport.calls(), 30);
        assert_eq!(breaker.counts().requests, 0);
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn test_half_open_probe_recovers() {
        let clock = Arc::new(ManualClock::new());
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let healthy_clone = healthy.clone();
        let transport = Arc::new(FnTransport::new(move |_| {
            let status = if healthy_clone.load(Ordering::SeqCst) {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            async move { Ok(Some(TransportResponse::new(status, BufferedBody::new("{}")))) }
        }));
        let (client, _hook) = client_with(transport.clone(), Some(guarded(clock.clone())));
        let ctx = RequestContext::new();

        for _ in 0..6 {
            let _ = client.get(&ctx, "corr", "http://localhost/pay", HeaderMap::new()).await;
        }
        let breaker = client.circuit_breaker().unwrap();
        assert!(breaker.is_open());

        healthy.store(true, Ordering::SeqCst);
        clock.advance_secs(60.0);

        let envelope = client
            .get(&ctx, "corr", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(envelope.status(), Some(StatusCode::OK));
        assert!(breaker.is_closed());
        assert_eq!(transport.calls(), 7);
    }

    #[tokio::test]
    async fn test_half_open_rejects_calls_beyond_max_requests() {
        let clock = Arc::new(ManualClock::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let transport = Arc::new(FnTransport::new(move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(Some(TransportResponse::new(StatusCode::OK, BufferedBody::new("{}"))))
            }
        }));
        let breaker =
            guarded(clock.clone()).ready_to_trip(|counts| counts.consecutive_failures >= 1);
        let (client, hook) = client_with(transport.clone(), Some(breaker));

        let breaker = client.circuit_breaker().unwrap().clone();
        breaker.admit().unwrap().failure();
        clock.advance_secs(60.0);
        assert_eq!(breaker.state(), State::HalfOpen);

        let first = tokio::spawn({
            let client = client.clone();
            async move {
                let ctx = RequestContext::new();
                client.get(&ctx, "first", "http://localhost/pay", HeaderMap::new()).await
            }
        });
        while breaker.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let ctx = RequestContext::new();
        let err = client
            .get(&ctx, "second", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::TooManyRequests { circuit } if circuit == "payments"));
        assert!(err.is_rejection());
        assert_eq!(transport.calls(), 1);

        release.notify_one();
        let envelope = first.await.unwrap().unwrap();
        assert_eq!(envelope.status(), Some(StatusCode::OK));
        assert!(breaker.is_closed());
        assert_eq!(hook.phases(), vec!["before", "before", "after", "after"]);
    }

    #[tokio::test]
    async fn test_timeout_through_breaker_is_normalized_and_counted() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(FnTransport::fail(
            TransportErrorKind::Timeout,
            "Client.Timeout exceeded while awaiting headers",
        ));
        let (client, _hook) = client_with(transport.clone(), Some(guarded(clock)));
        let breaker = client.circuit_breaker().unwrap().clone();
        let ctx = RequestContext::new();

        for attempt in 1..=6 {
            let err = client
                .get(&ctx, "corr", "http://localhost/pay", HeaderMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Timeout), "attempt {attempt}: {err:?}");
        }

        assert!(breaker.is_open());
        let err = client
            .get(&ctx, "corr", "http://localhost/pay", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_concurrent_calls() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(FnTransport::fail(TransportErrorKind::Connect, "refused"));
        let (client, _hook) = client_with(transport.clone(), Some(guarded(clock)));
        let client = Arc::new(client);

        for _ in 0..6 {
            let _ = client
                .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
                .await;
        }

        let mut handles = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .get(
                        &RequestContext::new(),
                        &format!("corr-{i}"),
                        "http://localhost/pay",
                        HeaderMap::new(),
                    )
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        }
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test]
    async fn test_classifier_sees_round_trip_failure() {
        use crate::classifier::PredicateClassifier;

        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(respond(503, "maintenance"));
        let breaker = guarded(clock).failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<RoundTripFailure>()
                .map(|f| f.status() != Some(StatusCode::SERVICE_UNAVAILABLE))
                .unwrap_or(true)
        })));
        let (client, _hook) = client_with(transport.clone(), Some(breaker));

        for _ in 0..10 {
            let err = client
                .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ServerError { .. }));
        }

        let breaker = client.circuit_breaker().unwrap();
        assert!(breaker.is_closed());
        assert_eq!(breaker.counts().total_successes, 10);
        assert_eq!(transport.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_is_reported_as_timeout() {
        let transport = Arc::new(FnTransport::new(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }));
        let (client, hook) = client_with(transport, None);

        let ctx = RequestContext::with_timeout(Duration::from_millis(100));
        let err = client
            .get(&ctx, "corr", "http://localhost/slow", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(hook.phases(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_call() {
        let transport = Arc::new(FnTransport::new(|_| std::future::pending()));
        let (client, hook) = client_with(transport.clone(), None);

        let token = tokio_util::sync::CancellationToken::new();
        let ctx = RequestContext::with_cancellation(token.clone());
        token.cancel();

        let err = client
            .get(&ctx, "corr", "http://localhost/", HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(hook.events()[1].error, Some("request cancelled".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_still_fires_after_hook_and_frees_probe() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(FnTransport::new(|_| std::future::pending()));
        let breaker =
            guarded(clock.clone()).ready_to_trip(|counts| counts.consecutive_failures >= 1);
        let (client, hook) = client_with(transport, Some(breaker));

        let breaker = client.circuit_breaker().unwrap().clone();
        breaker.admit().unwrap().failure();
        clock.advance_secs(60.0);
        assert_eq!(breaker.state(), State::HalfOpen);

        let ctx = RequestContext::new();
        let call = client.get(&ctx, "corr", "http://localhost/pay", HeaderMap::new());
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        assert_eq!(hook.phases(), vec!["before", "after"]);
        assert_eq!(hook.events()[1].error, Some("request cancelled".to_string()));
        assert_eq!(breaker.in_flight(), 0);
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[tokio::test]
    async fn test_http_requester_trait_object() {
        let requester: Box<dyn HttpRequester> = Box::new(RestClient::new(respond(201, "")));

        let ctx = RequestContext::new();
        let envelope = requester
            .post(&ctx, "corr", "http://localhost/orders", HeaderMap::new(), Bytes::from("{}"))
            .await
            .unwrap();

        assert_eq!(envelope.status(), Some(StatusCode::CREATED));
        assert_eq!(envelope.body(), Some(&Bytes::new()));
        assert!(matches!(envelope.json::<serde_json::Value>(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_absent_hook_fails_build() {
        let err = RestClient::builder(respond(200, ""))
            .hook(crate::hooks::NoopHook)
            .hook_slot(None)
            .build()
            .unwrap_err();

        assert!(matches!(err, Error::Config(ref msg) if msg == "hook is nil"));
    }

    #[test]
    fn test_invalid_breaker_config_fails_build() {
        let err = RestClient::builder(respond(200, ""))
            .circuit_breaker(CircuitBreaker::builder("bad").jitter_factor(-0.1))
            .build()
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_shared_breaker_across_clients() {
        let clock = Arc::new(ManualClock::new());
        let breaker = Arc::new(guarded(clock).build().unwrap());
        let failing = Arc::new(FnTransport::fail(TransportErrorKind::Connect, "refused"));

        let first = RestClientBuilder::from_transport(failing.clone())
            .shared_circuit_breaker(breaker.clone())
            .build()
            .unwrap();
        let second = RestClientBuilder::from_transport(failing.clone())
            .shared_circuit_breaker(breaker.clone())
            .build()
            .unwrap();

        for client in [&first, &second, &first, &second, &first, &second] {
            let _ = client
                .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
                .await;
        }

        assert!(breaker.is_open());
        assert!(matches!(
            second
                .get(&RequestContext::new(), "corr", "http://localhost/pay", HeaderMap::new())
                .await,
            Err(Error::CircuitOpen { .. })
        ));
        assert_eq!(failing.calls(), 6);
    }
}
