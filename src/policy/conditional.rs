//! Standalone conditional-request header injection.
//!
//! Companion to the response cache for callers that manage validators
//! themselves: when the context metadata carries a stored `etag` or
//! `last_modified` value, the matching `If-None-Match` / `If-Modified-Since`
//! header is inserted (without clobbering explicit headers). Interpreting the
//! resulting `304` is the caller's concern.

use http::header::{HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

use crate::context::Context;
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

/// Metadata key carrying a stored entity tag.
pub const ETAG_KEY: &str = "etag";
/// Metadata key carrying a stored `Last-Modified` date.
pub const LAST_MODIFIED_KEY: &str = "last_modified";

/// Conditional-request policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionalPolicy;

impl ConditionalPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

impl IntoPolicy for ConditionalPolicy {
    fn into_policy(self) -> Policy {
        Policy::new(|ctx: Context, next: Next| async move {
            let mut ctx = ctx;
            if let Some(etag) = ctx.metadata_str(ETAG_KEY) {
                if let Ok(value) = HeaderValue::from_str(&etag) {
                    ctx = ctx.with_header_if_absent(IF_NONE_MATCH, value);
                }
            }
            if let Some(last_modified) = ctx.metadata_str(LAST_MODIFIED_KEY) {
                if let Ok(value) = HeaderValue::from_str(&last_modified) {
                    ctx = ctx.with_header_if_absent(IF_MODIFIED_SINCE, value);
                }
            }
            next.run(ctx).await
        })
        .with_slot(Slot::new(SlotKind::Other, "conditional"))
        .with_meta(Meta::new("conditional", MetaKind::Other))
    }
}
