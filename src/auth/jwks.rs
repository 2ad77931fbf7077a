//! JWT verification over a multi-algorithm key set.
//!
//! A [`KeySet`] maps `kid` values (or, failing that, algorithm identifiers)
//! to verification keys and either returns verified claims or a clear
//! failure. For the explicit unsafe mode, [`decode_exp_unverified`]
//! base64url-decodes the payload segment without any signature check and
//! clamps malformed tokens to a `VALIDATION` error.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jwt_simple::prelude::*;
use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};

/// Verification key for one JWT algorithm.
pub enum VerifyKey {
    /// HMAC-SHA256 symmetric key.
    HS256(Arc<HS256Key>),
    /// HMAC-SHA384 symmetric key.
    HS384(Arc<HS384Key>),
    /// HMAC-SHA512 symmetric key.
    HS512(Arc<HS512Key>),
    /// RSA-SHA256 public key.
    RS256(Arc<RS256PublicKey>),
    /// RSA-SHA384 public key.
    RS384(Arc<RS384PublicKey>),
    /// RSA-SHA512 public key.
    RS512(Arc<RS512PublicKey>),
    /// ECDSA P-256 public key.
    ES256(Arc<ES256PublicKey>),
    /// ECDSA P-384 public key.
    ES384(Arc<ES384PublicKey>),
    /// Ed25519 public key.
    EdDSA(Arc<Ed25519PublicKey>),
}

impl VerifyKey {
    /// The algorithm identifier this key verifies.
    pub fn alg_id(&self) -> &'static str {
        match self {
            Self::HS256(_) => "HS256",
            Self::HS384(_) => "HS384",
            Self::HS512(_) => "HS512",
            Self::RS256(_) => "RS256",
            Self::RS384(_) => "RS384",
            Self::RS512(_) => "RS512",
            Self::ES256(_) => "ES256",
            Self::ES384(_) => "ES384",
            Self::EdDSA(_) => "EdDSA",
        }
    }

    fn verify_token(&self, token: &str) -> Result<JWTClaims<NoCustomClaims>, jwt_simple::Error> {
        let opts = VerificationOptions::default();
        match self {
            Self::HS256(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::HS384(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::HS512(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::RS256(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::RS384(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::RS512(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::ES256(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::ES384(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
            Self::EdDSA(k) => k.verify_token::<NoCustomClaims>(token, Some(opts)),
        }
    }
}

/// Claims the bearer policy needs after verification.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// `exp` as seconds since the Unix epoch, if present.
    pub expires_at_secs: Option<u64>,
    /// `sub`, if present.
    pub subject: Option<String>,
    /// `iss`, if present.
    pub issuer: Option<String>,
}

struct KeyEntry {
    kid: Option<String>,
    key: VerifyKey,
}

/// A set of verification keys, selected by `kid` or algorithm.
#[derive(Default)]
pub struct KeySet {
    entries: Vec<KeyEntry>,
}

impl KeySet {
    /// Creates an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key selected by algorithm.
    pub fn add(mut self, key: VerifyKey) -> Self {
        self.entries.push(KeyEntry { kid: None, key });
        self
    }

    /// Adds a key selected by `kid` first, algorithm second.
    pub fn add_with_kid(mut self, kid: impl Into<String>, key: VerifyKey) -> Self {
        self.entries.push(KeyEntry {
            kid: Some(kid.into()),
            key,
        });
        self
    }

    /// Whether the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verifies a token and returns its claims, or a `VALIDATION` error.
    pub fn verify(&self, token: &str) -> Result<VerifiedClaims> {
        let metadata = jwt_simple::token::Token::decode_metadata(token).map_err(|e| {
            Error::new(ErrorCode::Validation, format!("cannot decode jwt header: {e}"))
        })?;

        let entry = metadata
            .key_id()
            .and_then(|kid| self.entries.iter().find(|e| e.kid.as_deref() == Some(kid)))
            .or_else(|| {
                self
                    .entries
                    .iter()
                    .find(|e| e.key.alg_id() == metadata.algorithm())
            })
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::Validation,
                    format!("no verification key for algorithm {}", metadata.algorithm()),
                )
            })?;

        let claims = entry.key.verify_token(token).map_err(|e| {
            Error::new(ErrorCode::Validation, format!("token verification failed: {e}"))
        })?;

        Ok(VerifiedClaims {
            expires_at_secs: claims.expires_at.map(|at| at.as_secs()),
            subject: claims.subject.clone(),
            issuer: claims.issuer.clone(),
        })
    }
}

/// Extracts `exp` without verifying the signature.
///
/// Only valid under the bearer policy's explicit unsafe mode. Malformed
/// tokens fail with a `VALIDATION` error rather than passing silently.
pub fn decode_exp_unverified(token: &str) -> Result<Option<u64>> {
    let payload = token.split('.').nth(1).ok_or_else(|| {
        Error::new(ErrorCode::Validation, "token is not a three-segment jwt")
    })?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        Error::new(ErrorCode::Validation, "jwt payload is not valid base64url").with_cause(e)
    })?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
        Error::new(ErrorCode::Validation, "jwt payload is not valid json").with_cause(e)
    })?;
    Ok(value.get("exp").and_then(Value::as_u64))
}
