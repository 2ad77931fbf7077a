//! Transport contract: what a connector must implement.
//!
//! The core never parses a connector's wire format; it only routes contexts
//! through it. A connector advertises [`Capabilities`] (checked by the slot
//! validator at client build time), optionally keeps protocol session state
//! behind `connect`/`disconnect`, and maps each [`Context`] to a [`Response`]
//! in HTTP-semantic status space.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{Next, Policy};
use crate::response::Response;
use crate::slot::{Slot, SlotKind};

pub mod http;

/// Boolean feature flags a connector advertises.
#[derive(Debug, Clone, Default)]
pub struct Capabilities(BTreeMap<String, bool>);

impl Capabilities {
    /// Creates an empty flag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a flag.
    pub fn enable(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), true);
        self
    }

    /// Records a flag with an explicit value.
    pub fn set(mut self, name: impl Into<String>, value: bool) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Whether a flag is present and truthy.
    pub fn supports(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    /// Iterates the advertised flag names (truthy only).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.as_str())
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |caps, name| caps.enable(name))
    }
}

/// Platform-specific I/O adapter.
///
/// Stateful protocols keep their session behind the connector; `connect`
/// establishes it, `disconnect` tears it down, and `request` uses it. HTTP
/// connectors may treat both as no-ops.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Feature flags used by the chain validator.
    fn capabilities(&self) -> &Capabilities;

    /// Establishes protocol state for an endpoint. Default: no-op.
    async fn connect(&self, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    /// Performs the I/O for one context.
    async fn request(&self, ctx: &Context) -> Result<Response>;

    /// Tears down protocol state. Default: no-op.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Wraps a connector as the chain-terminating transport policy.
///
/// The policy never calls `next`; the validator guarantees it sits last.
pub fn transport_policy(connector: Arc<dyn Connector>) -> Policy {
    let meta = Meta::new("transport", MetaKind::Other);
    Policy::new(move |ctx: Context, _next: Next| {
        let connector = connector.clone();
        async move {
            if ctx.cancel_token().is_cancelled() {
                return Err(Error::new(ErrorCode::Cancelled, "request cancelled"));
            }
            connector.request(&ctx).await
        }
    })
    .with_slot(Slot::new(SlotKind::Transport, "transport"))
    .with_meta(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_report_truthy_flags_only() {
        let caps = Capabilities::new().enable("http").set("streaming", false);
        assert!(caps.supports("http"));
        assert!(!caps.supports("streaming"));
        assert!(!caps.supports("tls"));
        assert_eq!(caps.names().collect::<Vec<_>>(), vec!["http"]);
    }

    #[test]
    fn capabilities_collect_from_names() {
        let caps: Capabilities = ["http", "tls"].into_iter().collect();
        assert!(caps.supports("http"));
        assert!(caps.supports("tls"));
    }
}
