//! Body-descriptor serialization policy.
//!
//! Resolves a deferred [`BodyDescriptor`](crate::body::BodyDescriptor) into
//! wire bytes and assigns `Content-Type` from the descriptor when no explicit
//! header is present. Form-like containers (multipart) are left untouched;
//! the multipart policy computes their boundary and content type. Everything
//! else passes through.
//!
//! Serialization failures surface directly; the retry policy does not recover
//! from them.

use http::header::{HeaderValue, CONTENT_TYPE};

use crate::body::RequestBody;
use crate::context::Context;
use crate::error::{Error, ErrorCode};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

/// Serialization policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializePolicy;

impl SerializePolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

impl IntoPolicy for SerializePolicy {
    fn into_policy(self) -> Policy {
        Policy::new(|ctx: Context, next: Next| async move {
            let RequestBody::Descriptor(descriptor) = ctx.body() else {
                return next.run(ctx).await;
            };
            let descriptor = descriptor.clone();
            let bytes = descriptor.serialize()?;
            let mut ctx = ctx.with_body(RequestBody::Bytes(bytes));
            if !ctx.headers().contains_key(CONTENT_TYPE) {
                if let Some(content_type) = &descriptor.content_type {
                    let value = HeaderValue::from_str(content_type).map_err(|e| {
                        Error::new(
                            ErrorCode::Validation,
                            "descriptor content type is not a valid header value",
                        )
                        .with_cause(e)
                    })?;
                    ctx = ctx.with_header(CONTENT_TYPE, value);
                }
            }
            next.run(ctx).await
        })
        .with_slot(Slot::new(SlotKind::Other, "serialize"))
        .with_meta(Meta::new("serialize", MetaKind::Other))
    }
}
