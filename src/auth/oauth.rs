//! OAuth bearer policy: JWT expiry checks, single-flight refresh, and a
//! one-shot replay on 401.
//!
//! Per call the policy obtains the current token from the cache (refreshing
//! when absent), checks its `exp` against `now + skew` (refreshing when
//! stale), inserts `Authorization: Bearer …`, and runs the chain. A 401
//! response carrying a Bearer challenge triggers one refresh and exactly one
//! replay; a second 401 propagates as a response.
//!
//! Refreshes are single-flight per supplier key: concurrent callers share one
//! in-flight fetch, and a 30 s watchdog clears the lock if a fetch never
//! settles.
//!
//! Construction fails unless a verification [`KeySet`] is supplied or the
//! caller explicitly opts into unsafe mode (unverified `exp` extraction), in
//! which case a prominent warning is logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::header::{HeaderValue, AUTHORIZATION};
use http::StatusCode;
use serde_json::json;
use url::Url;

use crate::auth::jwks::{decode_exp_unverified, KeySet};
use crate::auth::token_cache::{TokenCache, TokenGrant};
use crate::client::Client;
use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::interpolate::interpolate;
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

const REFRESH_WATCHDOG: Duration = Duration::from_secs(30);

/// Produces fresh tokens on demand.
#[async_trait]
pub trait TokenSupplier: Send + Sync + 'static {
    /// Cache key identifying this supplier (`token_url::client_id[::scope]`).
    fn cache_key(&self) -> String;

    /// Fetches a fresh grant from the provider.
    async fn fetch(&self) -> Result<TokenGrant>;
}

type RefreshFut = Shared<BoxFuture<'static, Result<TokenGrant, Error>>>;
type OnRefresh = Arc<dyn Fn(&TokenGrant) + Send + Sync>;

struct State {
    supplier: Arc<dyn TokenSupplier>,
    jwks: Option<Arc<KeySet>>,
    skew: Duration,
    auto_refresh: bool,
    cache: Arc<TokenCache>,
    on_refresh: Option<OnRefresh>,
    locks: Arc<DashMap<String, (u64, RefreshFut)>>,
    generation: AtomicU64,
}

/// Builder for [`OAuthBearer`].
pub struct OAuthBearerBuilder {
    supplier: Arc<dyn TokenSupplier>,
    jwks: Option<Arc<KeySet>>,
    skew: Duration,
    auto_refresh: bool,
    allow_unsafe_mode: bool,
    cache: Option<Arc<TokenCache>>,
    on_refresh: Option<OnRefresh>,
}

impl OAuthBearerBuilder {
    fn new(supplier: Arc<dyn TokenSupplier>) -> Self {
        Self {
            supplier,
            jwks: None,
            skew: Duration::from_secs(60),
            auto_refresh: true,
            allow_unsafe_mode: false,
            cache: None,
            on_refresh: None,
        }
    }

    /// Supplies the verification key set.
    pub fn jwks(mut self, keys: KeySet) -> Self {
        self.jwks = Some(Arc::new(keys));
        self
    }

    /// Clock-skew allowance applied to `exp`. Default: 60 s.
    pub fn skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Enables or disables the 401 refresh-and-replay. Default: enabled.
    pub fn auto_refresh(mut self, yes: bool) -> Self {
        self.auto_refresh = yes;
        self
    }

    /// Opts into running without signature verification.
    pub fn allow_unsafe_mode(mut self, yes: bool) -> Self {
        self.allow_unsafe_mode = yes;
        self
    }

    /// Replaces the process-global token cache (mainly for tests).
    pub fn cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Observer invoked after every successful refresh.
    pub fn on_refresh<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TokenGrant) + Send + Sync + 'static,
    {
        self.on_refresh = Some(Arc::new(callback));
        self
    }

    /// Finishes the configuration.
    ///
    /// Fails with `VALIDATION` when no key set is present and unsafe mode was
    /// not explicitly enabled.
    pub fn build(self) -> Result<OAuthBearer> {
        if self.jwks.is_none() && !self.allow_unsafe_mode {
            return Err(Error::new(
                ErrorCode::Validation,
                "bearer policy requires a jwks key set; unverified tokens need allow_unsafe_mode",
            ));
        }
        if self.jwks.is_none() {
            tracing::warn!(
                target: "ika.oauth",
                "UNSAFE MODE: bearer tokens will not be signature-verified"
            );
        }
        Ok(OAuthBearer {
            supplier: self.supplier,
            jwks: self.jwks,
            skew: self.skew,
            auto_refresh: self.auto_refresh,
            cache: self.cache.unwrap_or_else(TokenCache::global),
            on_refresh: self.on_refresh,
        })
    }
}

/// Configured bearer policy; convert with [`IntoPolicy`].
pub struct OAuthBearer {
    supplier: Arc<dyn TokenSupplier>,
    jwks: Option<Arc<KeySet>>,
    skew: Duration,
    auto_refresh: bool,
    cache: Arc<TokenCache>,
    on_refresh: Option<OnRefresh>,
}

impl std::fmt::Debug for OAuthBearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthBearer")
            .field("skew", &self.skew)
            .field("auto_refresh", &self.auto_refresh)
            .finish_non_exhaustive()
    }
}

impl OAuthBearer {
    /// Starts a builder around a token supplier.
    pub fn builder(supplier: impl TokenSupplier) -> OAuthBearerBuilder {
        OAuthBearerBuilder::new(Arc::new(supplier))
    }
}

impl IntoPolicy for OAuthBearer {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("oauth-bearer", MetaKind::Auth)
            .with_option("skew_s", json!(self.skew.as_secs()))
            .with_option("auto_refresh", json!(self.auto_refresh))
            .with_option("verified", json!(self.jwks.is_some()));
        let state = Arc::new(State {
            supplier: self.supplier,
            jwks: self.jwks,
            skew: self.skew,
            auto_refresh: self.auto_refresh,
            cache: self.cache,
            on_refresh: self.on_refresh,
            locks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        });

        Policy::new(move |ctx: Context, next: Next| {
            let state = state.clone();
            async move {
                if let Ok(url) = Url::parse(ctx.url()) {
                    if !matches!(url.scheme(), "http" | "https") {
                        return Err(Error::new(
                            ErrorCode::UnsupportedAuthForTransport,
                            format!(
                                "bearer auth requires an http transport, got scheme `{}`",
                                url.scheme()
                            ),
                        ));
                    }
                }

                let key = state.supplier.cache_key();
                let mut token = match state.cache.get(&key) {
                    Some(cached) => cached.access_token,
                    None => refresh(&state, &key).await?.access_token,
                };

                if let Some(exp) = extract_exp(&state, &token)? {
                    let now = unix_now();
                    if exp <= now + state.skew.as_secs() {
                        tracing::debug!(target: "ika.oauth", "token expires within skew, refreshing");
                        token = refresh(&state, &key).await?.access_token;
                    }
                }

                let response = next
                    .clone()
                    .run(ctx.clone().with_header(AUTHORIZATION, bearer_value(&token)?))
                    .await?;

                let challenged = response.status() == StatusCode::UNAUTHORIZED
                    && state.auto_refresh
                    && response
                        .header_str("www-authenticate")
                        .map(|v| v.to_ascii_lowercase().contains("bearer"))
                        .unwrap_or(false);
                if !challenged {
                    return Ok(response);
                }

                tracing::debug!(target: "ika.oauth", "bearer challenge on 401, replaying once");
                state.cache.remove(&key);
                let fresh = refresh(&state, &key).await?.access_token;
                next
                    .run(ctx.with_header(AUTHORIZATION, bearer_value(&fresh)?))
                    .await
            }
        })
        .with_slot(Slot::new(SlotKind::Auth, "oauth-bearer").requires("http"))
        .with_meta(meta)
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
        Error::new(ErrorCode::Validation, "token is not a valid header value").with_cause(e)
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn extract_exp(state: &State, token: &str) -> Result<Option<u64>> {
    match &state.jwks {
        Some(keys) => Ok(keys.verify(token)?.expires_at_secs),
        None => decode_exp_unverified(token),
    }
}

/// Single-flight refresh: concurrent callers for one key share a fetch.
async fn refresh(state: &Arc<State>, key: &str) -> Result<TokenGrant> {
    let fut = match state.locks.entry(key.to_string()) {
        MapEntry::Occupied(occupied) => occupied.get().1.clone(),
        MapEntry::Vacant(vacant) => {
            let generation = state.generation.fetch_add(1, Ordering::SeqCst);
            let fut = {
                let state = state.clone();
                let key = key.to_string();
                async move {
                    let outcome = state.supplier.fetch().await;
                    state.locks.remove_if(&key, |_, (g, _)| *g == generation);
                    if let Ok(grant) = &outcome {
                        state.cache.set(&key, grant);
                        if let Some(callback) = &state.on_refresh {
                            callback(grant);
                        }
                    }
                    outcome
                }
                .boxed()
                .shared()
            };
            vacant.insert((generation, fut.clone()));

            // Watchdog: a fetch that never settles must not wedge the key.
            let state = state.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(REFRESH_WATCHDOG).await;
                if state
                    .locks
                    .remove_if(&key, |_, (g, _)| *g == generation)
                    .is_some()
                {
                    tracing::warn!(target: "ika.oauth", key = %key, "refresh lock expired without settling");
                }
            });
            fut
        }
    };
    fut.await
}

/// `client_credentials` grant supplier over an inner [`Client`].
pub struct ClientCredentialsSupplier {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
}

/// Builder for [`ClientCredentialsSupplier`].
pub struct ClientCredentialsBuilder {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    vars: std::collections::BTreeMap<String, String>,
}

impl ClientCredentialsBuilder {
    /// Sets the granted scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Registers a `${name}` interpolation variable usable in the token URL,
    /// client id, and client secret.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Finishes the configuration, resolving interpolation variables.
    pub fn build(self) -> Result<ClientCredentialsSupplier> {
        Ok(ClientCredentialsSupplier {
            client: self.client,
            token_url: interpolate(&self.token_url, &self.vars)?,
            client_id: interpolate(&self.client_id, &self.vars)?,
            client_secret: interpolate(&self.client_secret, &self.vars)?,
            scope: self.scope,
        })
    }
}

impl ClientCredentialsSupplier {
    /// Starts a builder. The inner client performs the token request; keep its
    /// chain free of this same bearer policy.
    pub fn builder(
        client: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> ClientCredentialsBuilder {
        ClientCredentialsBuilder {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: None,
            vars: std::collections::BTreeMap::new(),
        }
    }
}

#[async_trait]
impl TokenSupplier for ClientCredentialsSupplier {
    fn cache_key(&self) -> String {
        TokenCache::derive_key(&self.token_url, &self.client_id, self.scope.as_deref())
    }

    async fn fetch(&self) -> Result<TokenGrant> {
        let mut pairs = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
        ];
        if let Some(scope) = &self.scope {
            pairs.push(("scope".to_string(), scope.clone()));
        }

        let response = self.client.post(&self.token_url).form(pairs).send().await?;
        if !response.ok() {
            return Err(
                Error::new(
                    ErrorCode::LoginRequestFailed,
                    format!("token endpoint answered {}", response.status()),
                )
                .with_status(response.status()),
            );
        }

        let value: serde_json::Value = response.json()?;
        let access_token = value
            .get("access_token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::TokenExtraction,
                    "token response carries no access_token",
                )
            })?
            .to_string();

        Ok(TokenGrant {
            access_token,
            token_type: value
                .get("token_type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Bearer")
                .to_string(),
            scope: value
                .get("scope")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            expires_in: value.get("expires_in").and_then(serde_json::Value::as_u64),
        })
    }
}
