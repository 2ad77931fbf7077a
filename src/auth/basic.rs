//! HTTP Basic authentication policy.
//!
//! Injects `Authorization: Basic <base64(user:password)>` unless the caller
//! already set an explicit Authorization header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{HeaderValue, AUTHORIZATION};

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

/// Static-credential Basic auth.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    /// Creates the policy from static credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> Result<HeaderValue> {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|e| {
            Error::new(ErrorCode::Validation, "credentials are not a valid header value")
                .with_cause(e)
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl IntoPolicy for BasicAuth {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("basic-auth", MetaKind::Auth);
        Policy::new(move |ctx: Context, next: Next| {
            let auth = self.clone();
            async move {
                let value = auth.header_value()?;
                next.run(ctx.with_header_if_absent(AUTHORIZATION, value)).await
            }
        })
        .with_slot(Slot::new(SlotKind::Auth, "basic-auth").requires("http"))
        .with_meta(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::Arc;

    use crate::policy::Chain;
    use crate::response::{Payload, Response};

    #[tokio::test]
    async fn injects_encoded_credentials() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let terminal = Policy::new(move |ctx: Context, _next: Next| {
            let seen = seen_inner.clone();
            async move {
                seen
                    .lock()
                    .push(ctx.header_str("authorization").map(str::to_string));
                Ok(Response::new(StatusCode::OK, Payload::Empty))
            }
        });
        let chain = Chain::new(vec![
            BasicAuth::new("aladdin", "opensesame").into_policy(),
            terminal,
        ]);

        chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert_eq!(
            seen.lock()[0].as_deref(),
            Some("Basic YWxhZGRpbjpvcGVuc2VzYW1l")
        );
    }
}
