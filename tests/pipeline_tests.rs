//! End-to-end pipeline scenarios against a scripted connector.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use serde_json::json;

use ika::auth::oauth::{OAuthBearer, TokenSupplier};
use ika::auth::token_cache::{TokenCache, TokenGrant};
use ika::client::Client;
use ika::context::Context;
use ika::error::Result;
use ika::policy::cache::CachePolicy;
use ika::policy::dedupe::DedupePolicy;
use ika::policy::parse::ParsePolicy;
use ika::policy::serialize::SerializePolicy;
use ika::response::{Payload, Response};
use ika::retry::backoff::ExponentialBackoff;
use ika::retry::{http_predicate, RetryPolicy};
use ika::transport::{Capabilities, Connector};

type Script = dyn Fn(u32, &Context) -> Response + Send + Sync;

/// Connector that answers from a script and records every context.
struct ScriptedConnector {
    capabilities: Capabilities,
    calls: AtomicU32,
    seen: Arc<parking_lot::Mutex<Vec<Context>>>,
    script: Box<Script>,
}

impl ScriptedConnector {
    fn new<F>(script: F) -> (Arc<parking_lot::Mutex<Vec<Context>>>, Self)
    where
        F: Fn(u32, &Context) -> Response + Send + Sync + 'static,
    {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let connector = Self {
            capabilities: Capabilities::new().enable("http"),
            calls: AtomicU32::new(0),
            seen: seen.clone(),
            script: Box::new(script),
        };
        (seen, connector)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn request(&self, ctx: &Context) -> Result<Response> {
        self.seen.lock().push(ctx.clone());
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.script)(n, ctx))
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    Response::new(status, Payload::Bytes(Bytes::from(body.to_string())))
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
}

#[tokio::test(start_paused = true)]
async fn retry_then_cache_then_dedupe_compose() {
    let (seen, connector) = ScriptedConnector::new(|n, _ctx| {
        if n == 0 {
            // First attempt fails; retry should recover.
            Response::new(StatusCode::INTERNAL_SERVER_ERROR, Payload::Empty)
        } else {
            json_response(StatusCode::OK, json!({"users": [1, 2, 3]}))
                .with_header(HeaderName::from_static("etag"), HeaderValue::from_static("\"v1\""))
        }
    });

    let client = Client::builder()
        .policy(DedupePolicy::builder().ttl(Duration::from_millis(50)).build())
        .policy(
            CachePolicy::builder()
                .ttl(Duration::from_secs(60))
                .build(),
        )
        .policy(
            RetryPolicy::builder()
                .predicate(http_predicate([]))
                .strategy(
                    ExponentialBackoff::new()
                        .initial(Duration::from_millis(10))
                        .jitter(false),
                )
                .tries(3)
                .build(),
        )
        .policy(ParsePolicy::new())
        .connector(connector)
        .build()
        .unwrap();

    let first = client.get("https://api.example.com/users").send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(seen.lock().len(), 2, "one failed attempt plus one success");

    // Within the cache TTL the downstream chain is not invoked again.
    tokio::time::advance(Duration::from_millis(100)).await;
    let second = client.get("https://api.example.com/users").send().await.unwrap();
    assert_eq!(second.header_str("x-cache"), Some("HIT"));
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dedupe_coalesces_through_the_whole_chain() {
    let (seen, connector) = ScriptedConnector::new(|_n, _ctx| {
        json_response(StatusCode::OK, json!({"ok": true}))
    });

    let client = Client::builder()
        .policy(DedupePolicy::builder().ttl(Duration::from_millis(100)).build())
        .policy(RetryPolicy::builder().tries(2).build())
        .connector(connector)
        .build()
        .unwrap();

    let (a, b, c) = tokio::join!(
        client.get("https://api.example.com/users").send(),
        client.get("https://api.example.com/users").send(),
        client.get("https://api.example.com/users").send(),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(seen.lock().len(), 1, "three callers share one transport hit");
}

struct StaticSupplier {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TokenSupplier for StaticSupplier {
    fn cache_key(&self) -> String {
        "https://idp.example.com/token::pipeline".into()
    }

    async fn fetch(&self) -> Result<TokenGrant> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        use base64::Engine;
        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 7200;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(json!({"exp": exp, "n": n}).to_string());
        Ok(TokenGrant {
            access_token: format!("h.{payload}.s"),
            token_type: "Bearer".into(),
            scope: None,
            expires_in: Some(3600),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn oauth_replay_composes_with_serialization() {
    let (seen, connector) = ScriptedConnector::new(|n, _ctx| {
        if n == 0 {
            Response::new(StatusCode::UNAUTHORIZED, Payload::Empty).with_header(
                http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"api\""),
            )
        } else {
            json_response(StatusCode::OK, json!({"created": true}))
        }
    });

    let supplier_calls = Arc::new(AtomicU32::new(0));
    let bearer = OAuthBearer::builder(StaticSupplier {
        calls: supplier_calls.clone(),
    })
    .allow_unsafe_mode(true)
    .cache(Arc::new(TokenCache::new()))
    .build()
    .unwrap();

    let client = Client::builder()
        .policy(bearer)
        .policy(SerializePolicy::new())
        .connector(connector)
        .build()
        .unwrap();

    let response = client
        .post("https://api.example.com/users")
        .json(json!({"name": "ada"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(supplier_calls.load(Ordering::SeqCst), 2);
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    // Both attempts carried serialized bodies and bearer headers, with a
    // fresh token on the replay.
    for ctx in seen.iter() {
        assert_eq!(ctx.header_str("content-type"), Some("application/json"));
        assert!(ctx.header_str("authorization").unwrap().starts_with("Bearer "));
    }
    assert_ne!(
        seen[0].header_str("authorization"),
        seen[1].header_str("authorization")
    );
}

#[tokio::test]
async fn chain_introspection_names_every_policy() {
    let (_seen, connector) =
        ScriptedConnector::new(|_n, _ctx| Response::new(StatusCode::OK, Payload::Empty));

    let client = Client::builder()
        .policy(DedupePolicy::builder().build())
        .policy(CachePolicy::builder().build())
        .policy(
            RetryPolicy::builder()
                .strategy(ExponentialBackoff::new())
                .build(),
        )
        .connector(connector)
        .build()
        .unwrap();

    let tree = client.introspect().to_string();
    for name in ["dedupe", "response-cache", "retry", "exponential-backoff", "transport"] {
        assert!(tree.contains(name), "introspection tree misses `{name}`:\n{tree}");
    }
}
