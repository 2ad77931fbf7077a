//! Request and response body handling for the pipeline.
//!
//! Outbound bodies are modeled by [`RequestBody`]: raw bytes, text, structured
//! JSON, a deferred [`BodyDescriptor`], a multipart [`MultipartForm`], or a
//! one-shot byte stream. Descriptors decouple *what* the body is from *how* it
//! becomes bytes; the serialization policy performs the conversion late so
//! upstream policies can still inspect or replace the structured value.
//!
//! Inbound payloads are modeled by [`Payload`](crate::response::Payload),
//! which reuses [`ByteStream`] for lazy async sequences such as SSE or NDJSON.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};

/// A one-shot, shareable handle over an async byte sequence.
///
/// Cloning the handle shares the underlying stream; the first consumer that
/// calls [`ByteStream::take`] obtains it, later calls observe `None`. This
/// keeps payloads cloneable for caches and single-flight sharing while making
/// the consume-once contract explicit.
#[derive(Clone)]
pub struct ByteStream(Arc<Mutex<Option<BoxStream<'static, Result<Bytes>>>>>);

impl ByteStream {
    /// Wraps a stream of byte chunks.
    pub fn new<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::pin(stream)))))
    }

    /// Takes the underlying stream, leaving the handle (and all clones) empty.
    pub fn take(&self) -> Option<BoxStream<'static, Result<Bytes>>> {
        self.0.lock().take()
    }

    /// Whether the stream has already been consumed.
    pub fn is_consumed(&self) -> bool {
        self.0.lock().is_none()
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Outbound request body.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    None,
    /// Raw bytes, sent as-is.
    Bytes(Bytes),
    /// UTF-8 text, sent as-is.
    Text(String),
    /// Structured JSON value; a connector or the serialization policy turns
    /// it into bytes.
    Json(Value),
    /// Deferred body; resolved by the serialization policy.
    Descriptor(BodyDescriptor),
    /// Multipart form set; assembled by the multipart policy, which also
    /// computes the boundary.
    Form(MultipartForm),
    /// Streaming source. Not supported by the multipart policy; callers must
    /// materialize to bytes first.
    Stream(ByteStream),
}

impl RequestBody {
    /// Whether this body is a form-like container whose content type is
    /// computed by a downstream layer (multipart boundary).
    pub fn is_form_like(&self) -> bool {
        matches!(self, Self::Form(_))
    }

    /// Whether there is anything to send.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// What a [`BodyDescriptor`] defers.
#[derive(Clone, Debug)]
pub enum DescriptorData {
    /// JSON document.
    Json(Value),
    /// Plain text.
    Text(String),
    /// Pre-encoded bytes.
    Bytes(Bytes),
    /// Key-value pairs, encoded as `application/x-www-form-urlencoded`.
    UrlEncoded(Vec<(String, String)>),
}

/// A tagged record deferring body serialization to the serialization policy.
///
/// The descriptor carries the structured data plus the content type it will
/// declare once serialized, so "what body" stays separate from "how bytes".
#[derive(Clone, Debug)]
pub struct BodyDescriptor {
    /// The deferred data.
    pub data: DescriptorData,
    /// Content type the serialized bytes should be labeled with, if any.
    pub content_type: Option<String>,
}

impl BodyDescriptor {
    /// JSON descriptor labeled `application/json`.
    pub fn json(value: Value) -> Self {
        Self {
            data: DescriptorData::Json(value),
            content_type: Some("application/json".into()),
        }
    }

    /// Text descriptor labeled `text/plain; charset=utf-8`.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            data: DescriptorData::Text(value.into()),
            content_type: Some("text/plain; charset=utf-8".into()),
        }
    }

    /// Raw-bytes descriptor with an explicit content type.
    pub fn bytes(value: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            data: DescriptorData::Bytes(value.into()),
            content_type,
        }
    }

    /// Form descriptor labeled `application/x-www-form-urlencoded`.
    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            data: DescriptorData::UrlEncoded(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            content_type: Some("application/x-www-form-urlencoded".into()),
        }
    }

    /// Resolves the descriptor to wire bytes.
    pub fn serialize(&self) -> Result<Bytes> {
        match &self.data {
            DescriptorData::Json(value) => {
                serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
                    Error::new(ErrorCode::Serialization, "failed to serialize json body")
                        .with_cause(e)
                })
            }
            DescriptorData::Text(text) => Ok(Bytes::from(text.clone())),
            DescriptorData::Bytes(bytes) => Ok(bytes.clone()),
            DescriptorData::UrlEncoded(pairs) => serde_urlencoded::to_string(pairs)
                .map(Bytes::from)
                .map_err(|e| {
                    Error::new(ErrorCode::Serialization, "failed to encode form body")
                        .with_cause(e)
                }),
        }
    }
}

/// A text field of a multipart form.
#[derive(Clone, Debug)]
pub struct FormField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

/// A file part of a multipart form.
#[derive(Clone, Debug)]
pub struct FormFile {
    /// Field name.
    pub name: String,
    /// Client-supplied filename; sanitized by the multipart policy.
    pub filename: String,
    /// File contents. Streams must be materialized before this point.
    pub data: Bytes,
    /// Declared media type, checked against the policy allowlist.
    pub content_type: String,
}

/// A multipart form body prior to assembly.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
    /// Text fields, emitted before files.
    pub fields: Vec<FormField>,
    /// File parts.
    pub files: Vec<FormFile>,
}

impl MultipartForm {
    /// Creates an empty form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a file part.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.files.push(FormFile {
            name: name.into(),
            filename: filename.into(),
            data: data.into(),
            content_type: content_type.into(),
        });
        self
    }
}
