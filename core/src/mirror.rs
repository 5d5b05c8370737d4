//! Read-only projections of requests and responses for observers

use crate::transport::HttpRequest;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Version};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Body as shown to observers: decoded JSON when possible, raw bytes otherwise
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MirrorBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Raw(Bytes),
}

impl MirrorBody {
    pub fn from_bytes(bytes: &Bytes) -> Self {
        if bytes.is_empty() {
            return MirrorBody::Empty;
        }

        match serde_json::from_slice(bytes) {
            Ok(value) => MirrorBody::Json(value),
            Err(_) => MirrorBody::Raw(bytes.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, MirrorBody::Empty)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            MirrorBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl Serialize for MirrorBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MirrorBody::Empty => serializer.serialize_none(),
            MirrorBody::Json(value) => value.serialize(serializer),
            MirrorBody::Raw(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

pub type HeaderSnapshot = BTreeMap<String, Vec<String>>;

/// Copy a header map into an ordered, serializable form
pub fn snapshot_headers(headers: &HeaderMap) -> HeaderSnapshot {
    let mut snapshot = HeaderSnapshot::new();
    for (name, value) in headers {
        snapshot
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    snapshot
}

/// Protocol string and major/minor numbers for an HTTP version
pub fn proto_parts(version: Version) -> (&'static str, u8, u8) {
    match version {
        Version::HTTP_09 => ("HTTP/0.9", 0, 9),
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    }
}

/// Outgoing request as observers see it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpRequestMirror {
    pub method: String,
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub proto: String,
    pub headers: HeaderSnapshot,
    pub body: MirrorBody,
    pub content_length: u64,
}

impl HttpRequestMirror {
    pub fn from_request(request: &HttpRequest) -> Self {
        let url = &request.url;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        Self {
            method: request.method.as_str().to_string(),
            url: url.to_string(),
            scheme: url.scheme().to_string(),
            host,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            proto: proto_parts(Version::HTTP_11).0.to_string(),
            headers: snapshot_headers(&request.headers),
            body: MirrorBody::from_bytes(&request.body),
            content_length: request.content_length(),
        }
    }
}

/// Incoming response as observers see it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseRaw {
    /// Status line text, e.g. `200 OK`
    pub status: String,
    pub status_code: u16,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: HeaderSnapshot,
    pub body: MirrorBody,
    /// Declared length; `None` when unknown
    pub content_length: Option<u64>,
}

impl ResponseRaw {
    /// Mirror of a response whose body has not been read yet
    pub fn from_head(
        status: StatusCode,
        version: Version,
        headers: &HeaderMap,
        content_length: Option<u64>,
    ) -> Self {
        let (proto, proto_major, proto_minor) = proto_parts(version);
        let status_text = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };

        Self {
            status: status_text,
            status_code: status.as_u16(),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            headers: snapshot_headers(headers),
            body: MirrorBody::Empty,
            content_length,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status_code).ok()
    }
}
