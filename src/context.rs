//! Per-request context handed through the policy chain.
//!
//! A [`Context`] is treated as immutable by convention: a policy that needs to
//! change the outbound request builds a derived context (the `with_*` methods
//! clone cheaply) and passes *that* to `next`. Headers are case-insensitive,
//! and policies must preserve headers they do not own.
//!
//! The metadata map is the policy-to-policy side channel: timing markers,
//! cache hints, and protocol-specific fields (mailbox, range, criteria) all
//! travel there, keyed by plain strings and valued as JSON.
//!
//! # Examples
//!
//! ```rust
//! use ika::context::Context;
//! use http::Method;
//!
//! let ctx = Context::new(Method::GET, "https://api.example.com/users")
//!     .try_header("accept", "application/json")
//!     .unwrap()
//!     .with_metadata("trace", serde_json::json!("abc123"));
//!
//! assert_eq!(ctx.header_str("Accept"), Some("application/json"));
//! assert_eq!(ctx.metadata_str("trace"), Some("abc123".to_string()));
//! ```

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::body::RequestBody;
use crate::error::{Error, ErrorCode, Result};

/// The per-request record passed along the chain.
#[derive(Clone, Debug)]
pub struct Context {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: RequestBody,
    metadata: BTreeMap<String, Value>,
    cancel: CancellationToken,
}

impl Context {
    /// Creates a context for a verb and fully-qualified endpoint.
    ///
    /// HTTP uses the standard verbs; other protocols use extension verbs such
    /// as `FETCH`, `SEARCH`, or `APPEND` (see [`Context::verb`]).
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::None,
            metadata: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builds an extension verb from a static protocol token.
    ///
    /// Panics only on tokens that are not valid method characters, which for
    /// the fixed protocol vocabularies used by facades cannot happen.
    pub fn verb(name: &'static str) -> Method {
        Method::from_bytes(name.as_bytes()).unwrap()
    }

    /// The request verb.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The fully-qualified endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The header map (case-insensitive lookups).
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, looked up case-insensitively.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The outbound body.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// The policy-to-policy metadata map.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// A metadata value, if present.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// A metadata value coerced to a string, if present and textual.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    }

    /// The cancellation token propagated to transports and sleeping policies.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Derived context with a different URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Derived context with a different verb.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Derived context with a typed header set (inserted, replacing any
    /// previous value of the same name).
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Derived context with a header parsed from strings.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::try_from(name).map_err(|e| {
            Error::new(ErrorCode::Validation, format!("invalid header name `{name}`"))
                .with_cause(e)
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::new(ErrorCode::Validation, "invalid header value").with_cause(e)
        })?;
        Ok(self.with_header(name, value))
    }

    /// Derived context with a header inserted only when absent.
    pub fn with_header_if_absent(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if !self.headers.contains_key(&name) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Derived context with a replaced body.
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Derived context with a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Derived context with a different cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let ctx = Context::new(Method::GET, "https://example.com")
            .try_header("X-Trace-Id", "t1")
            .unwrap();
        assert_eq!(ctx.header_str("x-trace-id"), Some("t1"));
        assert_eq!(ctx.header_str("X-TRACE-ID"), Some("t1"));
    }

    #[test]
    fn derived_context_preserves_unrelated_headers() {
        let base = Context::new(Method::GET, "https://example.com")
            .try_header("accept", "application/json")
            .unwrap();
        let derived = base
            .clone()
            .try_header("authorization", "Bearer t")
            .unwrap();
        assert_eq!(derived.header_str("accept"), Some("application/json"));
        assert_eq!(base.header_str("authorization"), None);
    }

    #[test]
    fn extension_verbs_are_supported() {
        let ctx = Context::new(Context::verb("FETCH"), "imap://mail.example.com/INBOX");
        assert_eq!(ctx.method().as_str(), "FETCH");
    }

    #[test]
    fn with_header_if_absent_keeps_existing_value() {
        let ctx = Context::new(Method::GET, "https://example.com")
            .try_header("if-none-match", "\"v1\"")
            .unwrap()
            .with_header_if_absent(
                http::header::IF_NONE_MATCH,
                HeaderValue::from_static("\"v2\""),
            );
        assert_eq!(ctx.header_str("if-none-match"), Some("\"v1\""));
    }
}
