//! Authentication policies and their supporting machinery.
//!
//! [`oauth`] implements the bearer policy (JWT expiry + skew checks,
//! single-flight token refresh, one-shot replay on 401), backed by the
//! process-global [`token_cache`] and the [`jwks`] verification abstraction.
//! [`basic`] provides static-credential Basic auth.

/// HTTP Basic authentication policy.
pub mod basic;

/// JWT verification key sets.
pub mod jwks;

/// OAuth bearer policy with single-flight refresh.
pub mod oauth;

/// Process-global OAuth token cache.
pub mod token_cache;
