//! Uniform response envelope, independent of the transport that produced it.
//!
//! Every connector maps its protocol outcome into HTTP-semantic status space:
//! 2xx success, 3xx redirect, 4xx caller fault, 5xx upstream fault. Policies
//! therefore reason about one shape regardless of whether the bytes came from
//! an HTTP fetch, an IMAP fetch, or an SMTP submission.

use std::borrow::Cow;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::body::ByteStream;
use crate::error::{Error, ErrorCode, Result};

/// Response payload: parsed value, raw bytes, or a lazy async sequence.
#[derive(Clone, Debug, Default)]
pub enum Payload {
    /// No payload.
    #[default]
    Empty,
    /// Raw bytes as received.
    Bytes(Bytes),
    /// Decoded UTF-8 text.
    Text(String),
    /// Parsed JSON document.
    Json(Value),
    /// Lazy async byte sequence (SSE, NDJSON). Consume-once; see
    /// [`ByteStream`].
    Stream(ByteStream),
}

impl Payload {
    /// The payload as bytes, when it has a byte representation.
    ///
    /// Structured payloads are re-encoded; streams return `None`.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Self::Empty => Some(Bytes::new()),
            Self::Bytes(b) => Some(b.clone()),
            Self::Text(t) => Some(Bytes::from(t.clone())),
            Self::Json(v) => serde_json::to_vec(v).ok().map(Bytes::from),
            Self::Stream(_) => None,
        }
    }

    /// The payload as text, when it is textual or valid UTF-8 bytes.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(t) => Some(Cow::Borrowed(t)),
            Self::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            Self::Json(v) => serde_json::to_string(v).ok().map(Cow::Owned),
            _ => None,
        }
    }
}

/// Uniform result envelope returned by every chain execution.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    data: Payload,
}

impl Response {
    /// Creates a response; the status text defaults to the canonical reason.
    pub fn new(status: StatusCode, data: Payload) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            data,
        }
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The short status description.
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// `true` when `200 <= status < 300`.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Response headers (case-insensitive lookups).
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, looked up case-insensitively.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The payload.
    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Deserializes a JSON payload into a typed value.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let parse_slice = |bytes: &[u8]| {
            serde_json::from_slice(bytes).map_err(|e| {
                Error::new(ErrorCode::Serialization, "failed to parse response body")
                    .with_cause(e)
            })
        };
        match &self.data {
            Payload::Json(v) => serde_json::from_value(v.clone()).map_err(|e| {
                Error::new(ErrorCode::Serialization, "failed to decode response body")
                    .with_cause(e)
            }),
            Payload::Bytes(b) => parse_slice(b),
            Payload::Text(t) => parse_slice(t.as_bytes()),
            _ => Err(Error::new(
                ErrorCode::Serialization,
                "response payload has no byte representation",
            )),
        }
    }

    /// Replaces the status text.
    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    /// Inserts a header, replacing any previous value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the whole header map.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Replaces the payload.
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_tracks_success_range() {
        assert!(Response::new(StatusCode::OK, Payload::Empty).ok());
        assert!(Response::new(StatusCode::NO_CONTENT, Payload::Empty).ok());
        assert!(!Response::new(StatusCode::NOT_MODIFIED, Payload::Empty).ok());
        assert!(!Response::new(StatusCode::INTERNAL_SERVER_ERROR, Payload::Empty).ok());
    }

    #[test]
    fn json_decodes_from_bytes_and_value() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct User {
            id: u32,
        }
        let from_bytes = Response::new(
            StatusCode::OK,
            Payload::Bytes(Bytes::from(r#"{"id": 7}"#)),
        );
        assert_eq!(from_bytes.json::<User>().unwrap(), User { id: 7 });

        let from_value = Response::new(
            StatusCode::OK,
            Payload::Json(serde_json::json!({"id": 9})),
        );
        assert_eq!(from_value.json::<User>().unwrap(), User { id: 9 });
    }

    #[test]
    fn status_text_defaults_to_canonical_reason() {
        let resp = Response::new(StatusCode::NOT_FOUND, Payload::Empty);
        assert_eq!(resp.status_text(), "Not Found");
    }
}
