//! Unified error type with stable, machine-readable codes.
//!
//! Every failure in the pipeline is an [`Error`]: a stable [`ErrorCode`], a
//! human-readable message, an optional cause chain, an optional HTTP-semantic
//! status, and arbitrary key-value context. Errors are cheap to clone (the
//! cause is reference-counted) so single-flight consumers can share one
//! failure across many awaiting callers.
//!
//! Validation errors (`DUPLICATE_POLICY`, `INVALID_SLOT`,
//! `MISSING_CAPABILITY`) surface when a client is built, never per request.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Connector could not complete I/O (connection refused, DNS failure).
    Network,
    /// A phase exceeded its time budget.
    Timeout,
    /// The request was cancelled through its cancellation token.
    Cancelled,
    /// Response arrived but its status indicates failure and the caller
    /// opted into status errors.
    Http,
    /// Body could not be serialized or response could not be parsed.
    Serialization,
    /// Two policies share the same `(slot kind, name)` pair.
    DuplicatePolicy,
    /// Chain ordering violated (transport not last, auth after parser).
    InvalidSlot,
    /// A policy requires a capability the transport does not advertise.
    MissingCapability,
    /// An auth policy was used with an incompatible transport.
    UnsupportedAuthForTransport,
    /// Content negotiation mismatch on the request side.
    UnsupportedMediaType,
    /// Content negotiation mismatch on the response side.
    NotAcceptable,
    /// URL could not be parsed or canonicalized.
    UrlNormalizationFailed,
    /// Body, multipart, or token checks failed (size, MIME, filename, JWT).
    Validation,
    /// Token endpoint answered 2xx but the token path was missing.
    TokenExtraction,
    /// Token endpoint answered non-2xx.
    LoginRequestFailed,
    /// Keychain mode requested but the OS store is not usable.
    KeychainUnavailable,
    /// Cryptographic operation failed (vault seal/open).
    Crypto,
    /// Variable interpolation hit a reference cycle.
    CircularReference,
    /// Variable interpolation exceeded the nesting limit.
    MaxRecursion,
}

impl ErrorCode {
    /// Stable string form, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Http => "HTTP",
            Self::Serialization => "SERIALIZATION",
            Self::DuplicatePolicy => "DUPLICATE_POLICY",
            Self::InvalidSlot => "INVALID_SLOT",
            Self::MissingCapability => "MISSING_CAPABILITY",
            Self::UnsupportedAuthForTransport => "UNSUPPORTED_AUTH_FOR_TRANSPORT",
            Self::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            Self::NotAcceptable => "NOT_ACCEPTABLE",
            Self::UrlNormalizationFailed => "URL_NORMALIZATION_FAILED",
            Self::Validation => "VALIDATION",
            Self::TokenExtraction => "TOKEN_EXTRACTION",
            Self::LoginRequestFailed => "LOGIN_REQUEST_FAILED",
            Self::KeychainUnavailable => "KEYCHAIN_UNAVAILABLE",
            Self::Crypto => "CRYPTO",
            Self::CircularReference => "CIRCULAR_REFERENCE",
            Self::MaxRecursion => "MAX_RECURSION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline error value.
///
/// Construct with [`Error::new`] and refine fluently:
///
/// ```rust
/// use ika::error::{Error, ErrorCode};
///
/// let err = Error::new(ErrorCode::Network, "connection refused")
///     .with_context("host", "api.example.com");
/// assert_eq!(err.code(), ErrorCode::Network);
/// ```
#[derive(Clone)]
pub struct Error {
    code: ErrorCode,
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    status: Option<StatusCode>,
    context: BTreeMap<String, String>,
}

impl Error {
    /// Creates an error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            status: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches an underlying cause, preserved through `source()`.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attaches the HTTP-semantic status that produced this error.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds a key-value context pair.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// The stable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Context map attached via [`Error::with_context`].
    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " [{}]", pairs.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("status", &self.status)
            .field("context", &self.context)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| &**c as &(dyn std::error::Error + 'static))
    }
}
