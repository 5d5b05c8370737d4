//! Default network transport backed by reqwest

use crate::errors::{Error, Result};
use crate::transport::{
    HttpRequest, ResponseBody, Transport, TransportError, TransportErrorKind, TransportResponse,
    TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whole-request timeout when `timeout_secs` is 0
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection (and TLS handshake) timeout when `connect_timeout_secs` is 0
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Timeouts for the network transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(non_zero_or(self.timeout_secs, DEFAULT_TIMEOUT_SECS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(non_zero_or(
            self.connect_timeout_secs,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ))
    }
}

fn non_zero_or(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}

/// [`Transport`] that sends requests over the network
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Wrap an already configured client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> TransportResult {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        Ok(Some(TransportResponse {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            content_length: response.content_length(),
            body: Box::new(ReqwestBody {
                inner: Some(response),
            }),
        }))
    }
}

/// Tag reqwest failures with the kind the executor classifies on
fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };

    TransportError::new(kind, err.to_string()).with_source(err)
}

struct ReqwestBody {
    inner: Option<reqwest::Response>,
}

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn read_all(&mut self) -> std::result::Result<Bytes, TransportError> {
        match self.inner.take() {
            Some(response) => response.bytes().await.map_err(map_reqwest_error),
            None => Err(TransportError::body("response body already consumed")),
        }
    }

    fn close(&mut self) -> std::result::Result<(), TransportError> {
        // Dropping the response returns the connection to the pool
        self.inner.take();
        Ok(())
    }
}
