//! Deadline policy: a duration budget converted into cancellation.
//!
//! Races the downstream chain against a timer. On expiry the child
//! cancellation token fires (connectors abort in-flight I/O and sleeping
//! policies abandon their sleeps) and the caller receives `TIMEOUT`.

use std::time::Duration;

use serde_json::json;

use crate::context::Context;
use crate::error::{Error, ErrorCode};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

/// Per-request deadline policy.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    budget: Duration,
}

impl TimeoutPolicy {
    /// Creates a policy with the given total budget.
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }
}

impl IntoPolicy for TimeoutPolicy {
    fn into_policy(self) -> Policy {
        let budget = self.budget;
        let meta = Meta::new("timeout", MetaKind::Other)
            .with_option("budget_ms", json!(budget.as_millis() as u64));

        Policy::new(move |ctx: Context, next: Next| async move {
            let child = ctx.cancel_token().child_token();
            let ctx = ctx.with_cancel(child.clone());
            tokio::select! {
                outcome = next.run(ctx) => outcome,
                _ = tokio::time::sleep(budget) => {
                    child.cancel();
                    Err(
                        Error::new(ErrorCode::Timeout, "request exceeded its time budget")
                            .with_context("budget_ms", budget.as_millis().to_string()),
                    )
                }
            }
        })
        .with_slot(Slot::new(SlotKind::Other, "timeout"))
        .with_meta(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};

    use crate::policy::Chain;
    use crate::response::{Payload, Response};

    fn slow_terminal(delay: Duration) -> Policy {
        Policy::new(move |ctx: Context, _next: Next| async move {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    Err(Error::new(ErrorCode::Cancelled, "cancelled"))
                }
                _ = tokio::time::sleep(delay) => {
                    Ok(Response::new(StatusCode::OK, Payload::Empty))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn slow_downstream_times_out() {
        let chain = Chain::new(vec![
            TimeoutPolicy::new(Duration::from_millis(50)).into_policy(),
            slow_terminal(Duration::from_secs(5)),
        ]);
        let err = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_downstream_is_untouched() {
        let chain = Chain::new(vec![
            TimeoutPolicy::new(Duration::from_secs(5)).into_policy(),
            slow_terminal(Duration::from_millis(10)),
        ]);
        let resp = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert!(resp.ok());
    }
}
