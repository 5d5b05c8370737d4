//! Buffered response handed back to callers

use crate::errors::{BoxError, Error, Result};
use crate::mirror::ResponseRaw;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

/// Fully buffered response body plus its debug mirrors
///
/// Built once per call and never mutated afterwards. Decoding reads the
/// buffered bytes only, so it can be repeated any number of times.
#[derive(Debug, Clone, Default)]
pub struct ResponseEnvelope {
    body: Option<Bytes>,
    curl: String,
    raw: ResponseRaw,
}

impl ResponseEnvelope {
    /// `body` is `None` only when nothing was buffered; a zero-length read is still a body
    pub fn new(body: Option<Bytes>, curl: String, raw: ResponseRaw) -> Self {
        Self { body, curl, raw }
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Rendered `curl` command for the request, empty if it could not be rendered
    pub fn curl(&self) -> &str {
        &self.curl
    }

    pub fn raw(&self) -> &ResponseRaw {
        &self.raw
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.raw.status_code()
    }

    /// Decode the buffered body with `decoder`
    pub fn decode<T, D, E>(&self, decoder: D) -> Result<T>
    where
        D: FnOnce(&[u8]) -> std::result::Result<T, E>,
        E: Into<BoxError>,
    {
        let body = self.body.as_ref().ok_or(Error::EmptyBody)?;
        decoder(&body[..]).map_err(|e| Error::Decode(e.into()))
    }

    /// Decode the buffered body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        self.decode(|bytes| serde_json::from_slice::<T>(bytes))
    }
}

/// Decode a possibly absent envelope
pub fn decode<T, D, E>(envelope: Option<&ResponseEnvelope>, decoder: D) -> Result<T>
where
    D: FnOnce(&[u8]) -> std::result::Result<T, E>,
    E: Into<BoxError>,
{
    envelope.ok_or(Error::NilEnvelope)?.decode(decoder)
}
