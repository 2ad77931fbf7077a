//! Method/status/header-aware response cache with conditional revalidation.
//!
//! Behavior per call:
//! - Non-cacheable methods pass through untouched.
//! - A fresh hit returns a copy of the stored response with `x-cache: HIT`
//!   and never invokes the downstream chain.
//! - A stale entry with validators (`ETag` / `Last-Modified`) triggers a
//!   conditional request; a `304` extends the stored entry's expiry and
//!   returns its body with `x-cache: REVALIDATED`, any other success replaces
//!   the entry.
//! - Misses forward and store successful, cacheable responses
//!   (`x-cache: MISS`).
//! - `Cache-Control` is honored: request `no-store` bypasses the cache,
//!   `no-cache` forces revalidation, response `no-store` prevents storage,
//!   `max-age=N` overrides the configured TTL, and `private` responses are
//!   only stored when explicitly opted in (the store is shared by default).
//! - `Vary` is respected by remembering the selected request-header values at
//!   store time; a mismatch is a miss. `Vary: *` is never stored.
//!
//! Keys canonicalize the URL (lowercase scheme/host, default port dropped,
//! query parameters sorted). Storage is pluggable and typed; the bundled
//! [`MemoryStorage`] keeps entries in process. Errors from downstream are
//! propagated and additionally invalidate the entry under the key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{Method, StatusCode};
use serde_json::json;
use tokio::time::Instant;
use url::Url;

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::response::{Payload, Response};
use crate::slot::{Slot, SlotKind};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

type KeyFn = Arc<dyn Fn(&Context) -> Result<String> + Send + Sync>;

/// One stored response.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Stored status code.
    pub status: u16,
    /// Stored status text.
    pub status_text: String,
    /// Stored headers as name/value strings.
    pub headers: Vec<(String, String)>,
    /// Stored body bytes.
    pub data: Bytes,
    /// When the entry was stored.
    pub stored_at: Instant,
    /// When the entry stops being fresh.
    pub expires_at: Instant,
    /// `ETag` validator, if the response carried one.
    pub etag: Option<String>,
    /// `Last-Modified` validator, if the response carried one.
    pub last_modified: Option<String>,
    /// `Vary`-selected request headers captured at store time.
    pub vary: Vec<(String, String)>,
}

impl CacheEntry {
    fn to_response(&self, verdict: &'static str) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let data = if self.data.is_empty() {
            Payload::Empty
        } else {
            Payload::Bytes(self.data.clone())
        };
        let mut response = Response::new(status, data).with_status_text(self.status_text.clone());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                response = response.with_header(name, value);
            }
        }
        response.with_header(X_CACHE, HeaderValue::from_static(verdict))
    }
}

/// Abstract async storage over string keys.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// Looks up an entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    /// Stores an entry, replacing any previous one.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;
    /// Removes an entry.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process storage backed by a concurrent map.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Cache configuration.
#[derive(Clone)]
pub struct Config {
    /// Default freshness lifetime. Default: 60 s.
    pub ttl: Duration,
    /// Cacheable verbs. Default: GET and HEAD.
    pub methods: Vec<Method>,
    /// Cacheable statuses; `None` means any 2xx.
    pub statuses: Option<Vec<u16>>,
    /// Store `Cache-Control: private` responses. Default: false.
    pub cache_private: bool,
    /// Custom key derivation. Default: canonicalized `"{method} {url}"`.
    pub key_fn: Option<KeyFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            methods: vec![Method::GET, Method::HEAD],
            statuses: None,
            cache_private: false,
            key_fn: None,
        }
    }
}

/// Builder for the response cache policy.
pub struct CacheBuilder {
    cfg: Config,
    storage: Option<Arc<dyn CacheStorage>>,
}

impl CacheBuilder {
    /// Starts from defaults (in-memory storage).
    pub fn new() -> Self {
        Self {
            cfg: Config::default(),
            storage: None,
        }
    }

    /// Sets the default freshness lifetime.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.cfg.ttl = ttl;
        self
    }

    /// Replaces the cacheable method set.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.cfg.methods = methods.into_iter().collect();
        self
    }

    /// Restricts cacheable statuses to an explicit list.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.cfg.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Opts into storing `Cache-Control: private` responses.
    pub fn cache_private(mut self, yes: bool) -> Self {
        self.cfg.cache_private = yes;
        self
    }

    /// Replaces the key derivation.
    pub fn key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Context) -> Result<String> + Send + Sync + 'static,
    {
        self.cfg.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Replaces the storage backend.
    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> CachePolicy {
        CachePolicy {
            cfg: self.cfg,
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
        }
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Response cache policy; convert with [`IntoPolicy`].
pub struct CachePolicy {
    cfg: Config,
    storage: Arc<dyn CacheStorage>,
}

impl CachePolicy {
    /// Starts a builder.
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }
}

impl IntoPolicy for CachePolicy {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("response-cache", MetaKind::Cache)
            .with_option("ttl_ms", json!(self.cfg.ttl.as_millis() as u64))
            .with_option("cache_private", json!(self.cfg.cache_private));
        let cfg = Arc::new(self.cfg);
        let storage = self.storage;

        Policy::new(move |ctx: Context, next: Next| {
            let cfg = cfg.clone();
            let storage = storage.clone();
            async move {
                if !cfg.methods.contains(ctx.method()) {
                    return next.run(ctx).await;
                }
                let request_cc = Directives::from_headers(ctx.headers());
                if request_cc.no_store {
                    return next.run(ctx).await;
                }

                let key = match &cfg.key_fn {
                    Some(f) => f(&ctx)?,
                    None => canonical_key(ctx.method(), ctx.url())?,
                };

                let now = Instant::now();
                if let Some(entry) = storage.get(&key).await? {
                    let vary_matches = entry
                        .vary
                        .iter()
                        .all(|(name, value)| ctx.header_str(name).unwrap_or("") == value);
                    if vary_matches {
                        if now < entry.expires_at && !request_cc.no_cache {
                            tracing::debug!(target: "ika.cache", key = %key, "fresh hit");
                            return Ok(entry.to_response("HIT"));
                        }
                        if entry.etag.is_some() || entry.last_modified.is_some() {
                            return revalidate(ctx, next, entry, &key, &cfg, &storage, now).await;
                        }
                    }
                }

                match next.run(ctx.clone()).await {
                    Ok(response) => {
                        store_if_cacheable(&ctx, &response, &key, &cfg, &storage, now).await?;
                        Ok(response.with_header(X_CACHE, HeaderValue::from_static("MISS")))
                    }
                    Err(error) => {
                        let _ = storage.delete(&key).await;
                        Err(error)
                    }
                }
            }
        })
        .with_slot(Slot::new(SlotKind::Cache, "response-cache"))
        .with_meta(meta)
    }
}

async fn revalidate(
    ctx: Context,
    next: Next,
    entry: CacheEntry,
    key: &str,
    cfg: &Config,
    storage: &Arc<dyn CacheStorage>,
    now: Instant,
) -> Result<Response> {
    let mut conditional = ctx.clone();
    if let Some(etag) = &entry.etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            conditional = conditional.with_header_if_absent(IF_NONE_MATCH, value);
        }
    }
    if let Some(last_modified) = &entry.last_modified {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            conditional = conditional.with_header_if_absent(IF_MODIFIED_SINCE, value);
        }
    }

    match next.run(conditional).await {
        Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
            let response_cc = Directives::from_headers(response.headers());
            let mut refreshed = entry;
            refreshed.expires_at = expiry(&response_cc, cfg.ttl, now);
            storage.set(key, refreshed.clone()).await?;
            tracing::debug!(target: "ika.cache", key = %key, "revalidated");
            Ok(refreshed.to_response("REVALIDATED"))
        }
        Ok(response) => {
            store_if_cacheable(&ctx, &response, key, cfg, storage, now).await?;
            Ok(response.with_header(X_CACHE, HeaderValue::from_static("MISS")))
        }
        Err(error) => {
            let _ = storage.delete(key).await;
            Err(error)
        }
    }
}

async fn store_if_cacheable(
    ctx: &Context,
    response: &Response,
    key: &str,
    cfg: &Config,
    storage: &Arc<dyn CacheStorage>,
    now: Instant,
) -> Result<()> {
    let response_cc = Directives::from_headers(response.headers());
    let status_cacheable = match &cfg.statuses {
        Some(list) => list.contains(&response.status().as_u16()),
        None => response.ok(),
    };
    let storable = response.ok()
        && status_cacheable
        && !response_cc.no_store
        && (!response_cc.private || cfg.cache_private);
    if !storable {
        return Ok(());
    }

    let Some(data) = response.data().to_bytes() else {
        // Streaming payloads have no stable byte form to store.
        return Ok(());
    };
    let vary = match vary_headers(response, ctx) {
        Some(vary) => vary,
        None => return Ok(()),
    };

    let entry = CacheEntry {
        status: response.status().as_u16(),
        status_text: response.status_text().to_string(),
        headers: response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        data,
        stored_at: now,
        expires_at: expiry(&response_cc, cfg.ttl, now),
        etag: response.header_str(ETAG.as_str()).map(str::to_string),
        last_modified: response
            .header_str(LAST_MODIFIED.as_str())
            .map(str::to_string),
        vary,
    };
    storage.set(key, entry).await
}

/// Selected request headers per the response's `Vary`; `None` means the
/// response must not be stored (`Vary: *`).
fn vary_headers(response: &Response, ctx: &Context) -> Option<Vec<(String, String)>> {
    let Some(value) = response.header_str("vary") else {
        return Some(Vec::new());
    };
    let mut selected = Vec::new();
    for name in value.split(',') {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        if name == "*" {
            return None;
        }
        let current = ctx.header_str(&name).unwrap_or("").to_string();
        selected.push((name, current));
    }
    Some(selected)
}

fn expiry(directives: &Directives, ttl: Duration, now: Instant) -> Instant {
    if directives.no_cache {
        return now;
    }
    match directives.max_age {
        Some(seconds) => now + Duration::from_secs(seconds),
        None => now + ttl,
    }
}

/// Recognized `Cache-Control` directives; unknown ones are ignored.
#[derive(Debug, Default, Clone)]
struct Directives {
    no_store: bool,
    no_cache: bool,
    private: bool,
    #[allow(dead_code)]
    public: bool,
    #[allow(dead_code)]
    must_revalidate: bool,
    max_age: Option<u64>,
}

impl Directives {
    fn from_headers(headers: &http::HeaderMap) -> Self {
        let mut parsed = BTreeMap::new();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(text) = value.to_str() else { continue };
            for part in text.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let mut kv = part.splitn(2, '=');
                let key = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
                let val = kv.next().map(|v| v.trim().trim_matches('"').to_string());
                parsed.insert(key, val);
            }
        }

        Self {
            no_store: parsed.contains_key("no-store"),
            no_cache: parsed.contains_key("no-cache"),
            private: parsed.contains_key("private"),
            public: parsed.contains_key("public"),
            must_revalidate: parsed.contains_key("must-revalidate"),
            max_age: parsed
                .get("max-age")
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse::<u64>().ok()),
        }
    }
}

/// Default cache key: verb plus canonicalized URL.
///
/// Lowercases scheme and host, drops default ports, and sorts query
/// parameters so equivalent URLs collide.
pub fn canonical_key(method: &Method, url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| {
        Error::new(
            ErrorCode::UrlNormalizationFailed,
            format!("malformed url `{url}`"),
        )
        .with_cause(e)
    })?;
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let mut canonical = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        canonical.push_str(&format!(":{port}"));
    }
    canonical.push_str(parsed.path());
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = serde_urlencoded::to_string(&pairs).map_err(|e| {
            Error::new(ErrorCode::UrlNormalizationFailed, "failed to re-encode query")
                .with_cause(e)
        })?;
        canonical.push('?');
        canonical.push_str(&query);
    }
    Ok(format!("{method} {canonical}"))
}
