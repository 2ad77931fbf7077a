//! A protocol-agnostic request runtime for async clients.
//!
//! Ika is a small composable kernel on top of which HTTP, SMTP, IMAP, and
//! GraphQL clients are assembled from reusable *policies* (middleware). A
//! caller declares a pipeline (authentication, retry, caching,
//! deduplication, rate-limit-aware backoff, serialization, parsing) and a
//! *transport* connector that performs the I/O, then invokes it uniformly
//! through a typed client surface.
//!
//! # High-level features
//! - Onion-model policy chains with a per-request [`context::Context`] and
//!   deterministic ordering
//! - Build-time chain validation: slot ordering, duplicates, and transport
//!   capability checks
//! - Predicate-driven retry with exponential backoff and `Retry-After`
//!   awareness
//! - Single-flight deduplication of equivalent in-flight requests
//! - Response caching with `ETag` / `Last-Modified` revalidation and
//!   `Cache-Control` handling
//! - OAuth bearer auth: JWT expiry + skew checks, single-flight token
//!   refresh, one-shot replay on 401
//! - AES-256-GCM secret vault with an scrypt-derived key, plus an
//!   OS-keychain backend and an auto-fallback resolver
//! - Introspection metadata on every policy for debugger-friendly chain
//!   trees
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use ika::client::Client;
//! use ika::policy::dedupe::DedupePolicy;
//! use ika::retry::RetryPolicy;
//! use ika::transport::http::HttpConnector;
//!
//! # async fn example() -> Result<(), ika::error::Error> {
//! let client = Client::builder()
//!     .policy(DedupePolicy::builder().build())
//!     .policy(RetryPolicy::builder().tries(3).build())
//!     .connector(HttpConnector::new())
//!     .build()?;
//!
//! let users = client.get("https://api.example.com/users").send().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [`policy`] composes cross-cutting concerns; the last chain position is
//!   always the transport.
//! - [`context::Context`] is immutable by convention: policies derive new
//!   contexts for `next` rather than mutating in place.
//! - [`transport::Connector`] is the narrow I/O contract; the kernel never
//!   parses a wire format.
//! - [`facade`] wraps the same client with protocol-specific ergonomics.

/// Authentication policies (Basic, OAuth bearer) and JWT verification.
pub mod auth;

/// Request and response body model, including deferred body descriptors.
pub mod body;

/// Client surface: builder, method sugar, per-call request assembly.
pub mod client;

/// Per-request context passed along the chain.
pub mod context;

/// Unified error type with stable codes.
pub mod error;

/// Protocol facades (IMAP, SMTP) over the generic client.
pub mod facade;

/// `${name}` template interpolation for configuration strings.
pub mod interpolate;

/// Introspection metadata attached to policies and strategies.
pub mod introspect;

/// Policy chain executor and the bundled policies.
pub mod policy;

/// Uniform response envelope.
pub mod response;

/// Retry primitive and delay strategies.
pub mod retry;

/// Secret storage: vault, keychain, and the backend resolver.
pub mod secrets;

/// Slot metadata and the build-time chain validator.
pub mod slot;

/// Transport contract and the bundled HTTP connector.
pub mod transport;

pub use bytes::Bytes;
pub use client::Client;
pub use context::Context;
pub use error::{Error, ErrorCode};
pub use http::{Method, StatusCode};
pub use response::Response;
