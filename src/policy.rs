//! Policy chain executor: onion-model middleware for requests.
//!
//! A [`Policy`] is a function of the inbound [`Context`] and a [`Next`]
//! continuation, returning a [`Response`]. Composing `[P0, P1, …, Pn-1]`
//! dispatches `P0(ctx, |c| P1(c, …))`: each policy sees the context produced
//! by its predecessor and the response returned by the rest of the chain.
//!
//! Contract: a policy invokes `next` at most once per call unless it is a
//! flow-control policy (retry re-enters the tail per attempt) or it
//! short-circuits (cache hit), in which case it must produce a `Response`
//! itself. The final policy of a valid chain is the transport.
//!
//! # Examples
//!
//! ```rust
//! use ika::policy::{Policy, Next};
//! use ika::context::Context;
//!
//! let logging = Policy::new(|ctx: Context, next: Next| async move {
//!     tracing::debug!(target: "ika.chain", url = ctx.url(), "dispatch");
//!     next.run(ctx).await
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::response::Response;
use crate::slot::Slot;

pub mod cache;
pub mod conditional;
pub mod dedupe;
pub mod multipart;
pub mod parse;
pub mod serialize;
pub mod timeout;

/// Boxed policy function, shared across chain clones.
pub type PolicyFn =
    Arc<dyn Fn(Context, Next) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// A middleware step: function plus optional slot and introspection metadata.
#[derive(Clone)]
pub struct Policy {
    func: PolicyFn,
    slot: Option<Slot>,
    meta: Option<Meta>,
}

impl Policy {
    /// Wraps an async function as a policy.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |ctx, next| func(ctx, next).boxed()),
            slot: None,
            meta: None,
        }
    }

    /// Attaches slot metadata used by the chain validator.
    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attaches introspection metadata.
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Slot metadata, if declared.
    pub fn slot(&self) -> Option<&Slot> {
        self.slot.as_ref()
    }

    /// Introspection metadata, if tagged.
    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    pub(crate) fn call(&self, ctx: Context, next: Next) -> BoxFuture<'static, Result<Response>> {
        (self.func)(ctx, next)
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("slot", &self.slot)
            .field("meta", &self.meta.as_ref().map(|m| m.name.clone()))
            .finish()
    }
}

/// Conversion into a [`Policy`], implemented by configured policy builders.
pub trait IntoPolicy {
    /// Produces the policy.
    fn into_policy(self) -> Policy;
}

impl IntoPolicy for Policy {
    fn into_policy(self) -> Policy {
        self
    }
}

/// The rest of the chain from a policy's point of view.
///
/// `Next` is cheap to clone; flow-control policies (retry) clone it to
/// re-enter the tail once per attempt. Ordinary policies run it at most once.
#[derive(Clone)]
pub struct Next {
    policies: Arc<[Policy]>,
    index: usize,
}

impl Next {
    pub(crate) fn head(policies: Arc<[Policy]>) -> Self {
        Self { policies, index: 0 }
    }

    /// Executes the remaining policies with the given context.
    pub async fn run(self, ctx: Context) -> Result<Response> {
        match self.policies.get(self.index) {
            Some(policy) => {
                let rest = Next {
                    policies: self.policies.clone(),
                    index: self.index + 1,
                };
                policy.call(ctx, rest).await
            }
            None => Err(Error::new(
                ErrorCode::InvalidSlot,
                "chain exhausted without a transport producing a response",
            )),
        }
    }
}

/// A validated, executable sequence of policies.
#[derive(Clone)]
pub struct Chain {
    policies: Arc<[Policy]>,
}

impl Chain {
    /// Builds a chain from an ordered policy list. Validation is the
    /// caller's concern (the client builder runs [`crate::slot::validate`]).
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies: policies.into(),
        }
    }

    /// The policies in declared order.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Executes the chain from position zero.
    pub async fn execute(&self, ctx: Context) -> Result<Response> {
        Next::head(self.policies.clone()).run(ctx).await
    }

    /// Introspection tree over the whole chain.
    pub fn meta(&self) -> Meta {
        Meta::new("chain", MetaKind::Other).with_children(
            self.policies
                .iter()
                .filter_map(|p| p.meta().cloned()),
        )
    }
}

/// Composes a sequence of policies into a single policy.
///
/// The composite runs its members in order and then continues with the outer
/// chain; composition is associative, so nesting composes the same pipeline
/// as a flat list. Member metadata is gathered into the composite's
/// `children`.
pub fn compose(policies: Vec<Policy>) -> Policy {
    let meta = Meta::new("compose", MetaKind::Other)
        .with_children(policies.iter().filter_map(|p| p.meta().cloned()));
    let inner: Arc<[Policy]> = policies.into();

    Policy::new(move |ctx: Context, next: Next| {
        let inner = inner.clone();
        async move {
            // Bridge policy: hands control back to the outer chain.
            let bridge = Policy::new(move |ctx: Context, _inner_next: Next| {
                let outer = next.clone();
                async move { outer.run(ctx).await }
            });
            let mut sub: Vec<Policy> = inner.to_vec();
            sub.push(bridge);
            Next::head(sub.into()).run(ctx).await
        }
    })
    .with_meta(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use serde_json::json;

    use crate::response::Payload;

    fn terminal(tag: &'static str) -> Policy {
        Policy::new(move |_ctx: Context, _next: Next| async move {
            Ok(Response::new(StatusCode::OK, Payload::Text(tag.into())))
        })
    }

    fn annotate(label: &'static str) -> Policy {
        Policy::new(move |ctx: Context, next: Next| async move {
            let ctx = ctx.with_metadata(label, json!(true));
            let resp = next.run(ctx).await?;
            let text = format!("{}+{label}", resp.status_text());
            Ok(resp.with_status_text(text))
        })
    }

    #[tokio::test]
    async fn policies_run_in_declared_order_outbound_and_reverse_inbound() {
        let chain = Chain::new(vec![annotate("outer"), annotate("inner"), terminal("t")]);
        let resp = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        // Inbound transforms apply innermost first.
        assert_eq!(resp.status_text(), "OK+inner+outer");
    }

    #[tokio::test]
    async fn composition_is_associative() {
        let flat = Chain::new(vec![annotate("a"), annotate("b"), annotate("c"), terminal("t")]);
        let nested = Chain::new(vec![
            compose(vec![annotate("a"), compose(vec![annotate("b"), annotate("c")])]),
            terminal("t"),
        ]);

        let ctx = Context::new(Method::GET, "https://example.com");
        let left = flat.execute(ctx.clone()).await.unwrap();
        let right = nested.execute(ctx).await.unwrap();
        assert_eq!(left.status_text(), right.status_text());
        assert_eq!(left.status(), right.status());
    }

    #[tokio::test]
    async fn exhausted_chain_is_an_invalid_slot_error() {
        let chain = Chain::new(vec![annotate("only")]);
        let err = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidSlot);
    }

    #[test]
    fn compose_gathers_children_metadata() {
        let tagged = Policy::new(|ctx: Context, next: Next| async move { next.run(ctx).await })
            .with_meta(Meta::new("inner", MetaKind::Other));
        let composed = compose(vec![tagged]);
        let meta = composed.meta().unwrap();
        assert_eq!(meta.name, "compose");
        assert_eq!(meta.children.len(), 1);
        assert_eq!(meta.children[0].name, "inner");
    }
}
