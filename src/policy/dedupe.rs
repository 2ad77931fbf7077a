//! Inflight request de-duplication (single-flight coalescing).
//!
//! Equivalent requests that overlap in time share one downstream execution,
//! keyed by `"{method} {url}"` unless a custom key function is supplied.
//!
//! Behavior:
//! - First caller for a key becomes the leader and drives the downstream
//!   chain; concurrent callers await the same shared outcome.
//! - A completed entry keeps serving its result until `ttl` elapses, then the
//!   next caller re-executes.
//! - Entries are dropped at `max(settlement, stored_at + ttl)`; failures are
//!   dropped immediately so errors are never replayed.
//! - When the map would exceed `max_size`, the oldest entry is evicted.
//!
//! Invariant: at any instant there is at most one inflight execution per key,
//! and every concurrent caller observes the same response data.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::Method;
use serde_json::json;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::response::Response;
use crate::slot::{Slot, SlotKind};

type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;
type SharedOutcome = Shared<BoxFuture<'static, Result<Response, Error>>>;

#[derive(Clone)]
struct Entry {
    fut: SharedOutcome,
    stored_at: Instant,
}

/// Coalescing configuration.
#[derive(Clone)]
pub struct Config {
    /// Verbs eligible for coalescing. Default: GET and HEAD.
    pub methods: Vec<Method>,
    /// How long a settled entry keeps serving its result. Default: 30 s.
    pub ttl: Duration,
    /// Map bound; the oldest entry is evicted beyond it. Default: 128.
    pub max_size: usize,
    /// Custom key derivation. Default: `"{method} {url}"`.
    pub key_fn: Option<KeyFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            methods: vec![Method::GET, Method::HEAD],
            ttl: Duration::from_secs(30),
            max_size: 128,
            key_fn: None,
        }
    }
}

/// Builder for the dedupe policy.
pub struct DedupeBuilder(Config);

impl DedupeBuilder {
    /// Starts from defaults.
    pub fn new() -> Self {
        Self(Config::default())
    }

    /// Replaces the eligible method set.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.0.methods = methods.into_iter().collect();
        self
    }

    /// Sets the result-sharing window.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.0.ttl = ttl;
        self
    }

    /// Sets the map bound.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.0.max_size = max_size.max(1);
        self
    }

    /// Replaces the key derivation.
    pub fn key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.0.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> DedupePolicy {
        DedupePolicy { cfg: self.0 }
    }
}

impl Default for DedupeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-flight policy; convert with [`IntoPolicy`].
pub struct DedupePolicy {
    cfg: Config,
}

impl DedupePolicy {
    /// Starts a builder.
    pub fn builder() -> DedupeBuilder {
        DedupeBuilder::new()
    }
}

impl IntoPolicy for DedupePolicy {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("dedupe", MetaKind::Cache)
            .with_option("ttl_ms", json!(self.cfg.ttl.as_millis() as u64))
            .with_option("max_size", json!(self.cfg.max_size))
            .with_option(
                "methods",
                json!(self.cfg.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>()),
            );
        let cfg = Arc::new(self.cfg);
        let store: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());

        Policy::new(move |ctx: Context, next: Next| {
            let cfg = cfg.clone();
            let store = store.clone();
            async move {
                if !cfg.methods.contains(ctx.method()) {
                    return next.run(ctx).await;
                }

                let key = match &cfg.key_fn {
                    Some(f) => f(&ctx),
                    None => format!("{} {}", ctx.method(), ctx.url()),
                };
                let now = Instant::now();

                enum Role {
                    Leader(SharedOutcome),
                    Follower(SharedOutcome),
                }

                let role = match store.entry(key.clone()) {
                    MapEntry::Occupied(mut occupied) => {
                        if now.duration_since(occupied.get().stored_at) < cfg.ttl {
                            Role::Follower(occupied.get().fut.clone())
                        } else {
                            let fut = share(ctx.clone(), next.clone());
                            occupied.insert(Entry {
                                fut: fut.clone(),
                                stored_at: now,
                            });
                            Role::Leader(fut)
                        }
                    }
                    MapEntry::Vacant(vacant) => {
                        let fut = share(ctx.clone(), next.clone());
                        vacant.insert(Entry {
                            fut: fut.clone(),
                            stored_at: now,
                        });
                        Role::Leader(fut)
                    }
                };

                match role {
                    Role::Follower(fut) => {
                        tracing::debug!(target: "ika.dedupe", key = %key, "joined inflight request");
                        fut.await
                    }
                    Role::Leader(fut) => {
                        evict_oldest(&store, &key, cfg.max_size);
                        let outcome = fut.await;
                        match &outcome {
                            Err(_) => {
                                store.remove(&key);
                            }
                            Ok(_) => {
                                let elapsed = now.elapsed();
                                if elapsed >= cfg.ttl {
                                    store.remove(&key);
                                } else {
                                    let store = store.clone();
                                    let key = key.clone();
                                    let remaining = cfg.ttl - elapsed;
                                    tokio::spawn(async move {
                                        tokio::time::sleep(remaining).await;
                                        store.remove_if(&key, |_, entry| entry.stored_at == now);
                                    });
                                }
                            }
                        }
                        outcome
                    }
                }
            }
        })
        .with_slot(Slot::new(SlotKind::Cache, "dedupe"))
        .with_meta(meta)
    }
}

fn share(ctx: Context, next: Next) -> SharedOutcome {
    async move { next.run(ctx).await }.boxed().shared()
}

fn evict_oldest(store: &DashMap<String, Entry>, protect: &str, max_size: usize) {
    while store.len() > max_size {
        let oldest = store
            .iter()
            .filter(|entry| entry.key() != protect)
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => {
                tracing::debug!(target: "ika.dedupe", key = %key, "evicting oldest entry");
                store.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::policy::Chain;
    use crate::response::Payload;

    fn counting_terminal(counter: Arc<AtomicU32>, fail_first: bool) -> Policy {
        Policy::new(move |_ctx: Context, _next: Next| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if fail_first && n == 0 {
                    Err(Error::new(crate::error::ErrorCode::Network, "boom"))
                } else {
                    Ok(Response::new(StatusCode::OK, Payload::Text(format!("call-{n}"))))
                }
            }
        })
    }

    fn chain(counter: Arc<AtomicU32>, ttl: Duration, max_size: usize, fail_first: bool) -> Chain {
        Chain::new(vec![
            DedupePolicy::builder()
                .ttl(ttl)
                .max_size(max_size)
                .build()
                .into_policy(),
            counting_terminal(counter, fail_first),
        ])
    }

    fn get(url: &str) -> Context {
        Context::new(Method::GET, url)
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_calls_share_one_execution() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_millis(100), 64, false);

        let (a, b, c) = tokio::join!(
            chain.execute(get("https://api.example.com/users")),
            chain.execute(get("https://api.example.com/users")),
            chain.execute(get("https://api.example.com/users")),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for resp in [a.unwrap(), b.unwrap(), c.unwrap()] {
            assert_eq!(resp.data().as_text().unwrap(), "call-0");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_re_executes() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_millis(100), 64, false);

        chain.execute(get("https://api.example.com/users")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        chain.execute(get("https://api.example.com/users")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entry_replays_within_ttl() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_secs(10), 64, false);

        let first = chain.execute(get("https://api.example.com/users")).await.unwrap();
        let second = chain.execute(get("https://api.example.com/users")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.data().as_text().unwrap(),
            second.data().as_text().unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_listed_methods_pass_through() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_secs(10), 64, false);

        let post = Context::new(Method::POST, "https://api.example.com/users");
        chain.execute(post.clone()).await.unwrap();
        chain.execute(post).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_replayed() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_secs(10), 64, true);

        let err = chain.execute(get("https://api.example.com/users")).await;
        assert!(err.is_err());
        let ok = chain.execute(get("https://api.example.com/users")).await;
        assert!(ok.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entry_is_evicted_beyond_max_size() {
        let counter = Arc::new(AtomicU32::new(0));
        let chain = chain(counter.clone(), Duration::from_secs(60), 1, false);

        chain.execute(get("https://api.example.com/a")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Replay within ttl from the same entry.
        chain.execute(get("https://api.example.com/a")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // A second key evicts the first.
        chain.execute(get("https://api.example.com/b")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        chain.execute(get("https://api.example.com/a")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
