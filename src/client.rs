//! Typed client surface over a validated policy chain.
//!
//! A [`Client`] is built once, policies in declared order with the transport
//! last, and validated at build time (slot ordering, duplicates,
//! capabilities).
//! Per request it offers method sugar (`get`, `post`, …) returning a
//! [`RequestBuilder`] that assembles the [`Context`], optionally threads a
//! per-call policy addendum, and executes the chain.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ika::client::Client;
//! use ika::policy::IntoPolicy;
//! use ika::retry::RetryPolicy;
//! use ika::transport::http::HttpConnector;
//!
//! # async fn example() -> Result<(), ika::error::Error> {
//! let client = Client::builder()
//!     .policy(RetryPolicy::builder().tries(3).build())
//!     .connector(HttpConnector::new())
//!     .build()?;
//!
//! let response = client.get("https://api.example.com/users").send().await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::body::{BodyDescriptor, MultipartForm, RequestBody};
use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::Meta;
use crate::policy::{Chain, IntoPolicy, Policy};
use crate::response::Response;
use crate::slot;
use crate::transport::{transport_policy, Connector};

/// Builder for [`Client`].
pub struct ClientBuilder {
    policies: Vec<Policy>,
    connector: Option<Arc<dyn Connector>>,
    base_url: Option<String>,
    default_headers: HeaderMap,
    error_for_status: bool,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            policies: Vec::new(),
            connector: None,
            base_url: None,
            default_headers: HeaderMap::new(),
            error_for_status: false,
        }
    }

    /// Appends a policy; request flow follows declaration order.
    pub fn policy(mut self, policy: impl IntoPolicy) -> Self {
        self.policies.push(policy.into_policy());
        self
    }

    /// Sets the transport connector (becomes the final chain position).
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets an already-shared connector.
    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Base URL that relative request paths resolve against.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Header applied to every request (explicit request headers win).
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Turns non-2xx responses into `HTTP`-kind errors.
    pub fn error_for_status(mut self, yes: bool) -> Self {
        self.error_for_status = yes;
        self
    }

    /// Validates the chain and produces the client.
    pub fn build(self) -> Result<Client> {
        let connector = self.connector.ok_or_else(|| {
            Error::new(ErrorCode::Validation, "a client requires a transport connector")
        })?;
        let mut policies = self.policies;
        policies.push(transport_policy(connector.clone()));
        slot::validate(&policies, connector.capabilities())?;

        Ok(Client {
            chain: Chain::new(policies),
            connector,
            base_url: self.base_url,
            default_headers: self.default_headers,
            error_for_status: self.error_for_status,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated policy chain plus request ergonomics.
#[derive(Clone)]
pub struct Client {
    chain: Chain,
    connector: Arc<dyn Connector>,
    base_url: Option<String>,
    default_headers: HeaderMap,
    error_for_status: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("default_headers", &self.default_headers)
            .field("error_for_status", &self.error_for_status)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Starts a builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// GET request builder.
    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    /// POST request builder.
    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    /// PUT request builder.
    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    /// PATCH request builder.
    pub fn patch(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    /// DELETE request builder.
    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    /// HEAD request builder.
    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    /// OPTIONS request builder.
    pub fn options(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    /// Request builder for any verb, including protocol extension verbs.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            method,
            url: self.resolve_url(url),
            headers: HeaderMap::new(),
            body: RequestBody::None,
            metadata: Vec::new(),
            cancel: None,
            addenda: Vec::new(),
            deferred_error: None,
        }
    }

    /// Establishes connector session state for an endpoint.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        self.connector.connect(endpoint).await
    }

    /// Tears down connector session state.
    pub async fn disconnect(&self) -> Result<()> {
        self.connector.disconnect().await
    }

    /// Executes a prepared context through the validated chain.
    pub async fn execute(&self, ctx: Context) -> Result<Response> {
        let response = self.chain.execute(ctx).await?;
        self.check_status(response)
    }

    /// Introspection tree over the client's chain.
    pub fn introspect(&self) -> Meta {
        self.chain.meta()
    }

    fn check_status(&self, response: Response) -> Result<Response> {
        if !self.error_for_status || response.ok() {
            return Ok(response);
        }
        let code = match response.status() {
            StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorCode::UnsupportedMediaType,
            StatusCode::NOT_ACCEPTABLE => ErrorCode::NotAcceptable,
            _ => ErrorCode::Http,
        };
        Err(
            Error::new(
                code,
                format!(
                    "request failed with {} {}",
                    response.status(),
                    response.status_text()
                ),
            )
            .with_status(response.status()),
        )
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url.to_string(),
        }
    }
}

/// One request under assembly.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: RequestBody,
    metadata: Vec<(String, Value)>,
    cancel: Option<CancellationToken>,
    addenda: Vec<Policy>,
    deferred_error: Option<Error>,
}

impl<'a> RequestBuilder<'a> {
    /// Adds a typed header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a header parsed from strings; parse failures surface on `send`.
    pub fn try_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => {
                self.deferred_error = Some(Error::new(
                    ErrorCode::Validation,
                    format!("invalid header `{name}`"),
                ));
            }
        }
        self
    }

    /// JSON body via a deferred descriptor.
    pub fn json(mut self, value: Value) -> Self {
        self.body = RequestBody::Descriptor(BodyDescriptor::json(value));
        self
    }

    /// Text body via a deferred descriptor.
    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.body = RequestBody::Descriptor(BodyDescriptor::text(value));
        self
    }

    /// URL-encoded form body via a deferred descriptor.
    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Descriptor(BodyDescriptor::form(pairs));
        self
    }

    /// Multipart form body, assembled by the multipart policy.
    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Form(form);
        self
    }

    /// Any explicit body.
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Adds a metadata entry for downstream policies.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    /// Attaches a cancellation token.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Threads a per-call policy, running before the client's own chain.
    pub fn policy(mut self, policy: impl IntoPolicy) -> Self {
        self.addenda.push(policy.into_policy());
        self
    }

    /// Executes the request.
    pub async fn send(self) -> Result<Response> {
        if let Some(error) = self.deferred_error {
            return Err(error);
        }

        let mut ctx = Context::new(self.method, self.url).with_body(self.body);
        for (name, value) in self.client.default_headers.iter() {
            ctx = ctx.with_header_if_absent(name.clone(), value.clone());
        }
        for (name, value) in self.headers.iter() {
            ctx = ctx.with_header(name.clone(), value.clone());
        }
        for (key, value) in self.metadata {
            ctx = ctx.with_metadata(key, value);
        }
        if let Some(token) = self.cancel {
            ctx = ctx.with_cancel(token);
        }

        if self.addenda.is_empty() {
            return self.client.execute(ctx).await;
        }

        // Per-call addendum: revalidate the extended chain, then execute it.
        let mut policies = self.addenda;
        policies.extend(self.client.chain.policies().iter().cloned());
        slot::validate(&policies, self.client.connector.capabilities())?;
        let response = Chain::new(policies).execute(ctx).await?;
        self.client.check_status(response)
    }
}
