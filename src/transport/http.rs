//! HTTP connector over hyper's HTTP/1.1 client connection.
//!
//! Dials a fresh TCP (or rustls TLS) connection per request, performs the
//! HTTP/1 handshake, and collects the response body into bytes. The connector
//! is stateless (`connect`/`disconnect` are no-ops) and advertises the
//! `http` and `tls` capabilities. Streaming request bodies and multipart
//! containers must be materialized upstream (serialization and multipart
//! policies) before they reach this layer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::HeaderValue;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::body::RequestBody;
use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::response::{Payload, Response};
use crate::transport::{Capabilities, Connector};

/// HTTP/1.1 connector with plain-TCP and TLS paths.
pub struct HttpConnector {
    capabilities: Capabilities,
    tls: Arc<rustls::ClientConfig>,
}

impl HttpConnector {
    /// Creates a connector trusting the bundled webpki root set.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            capabilities: Capabilities::new().enable("http").enable("tls"),
            tls: Arc::new(tls),
        }
    }

    async fn exchange<T>(
        &self,
        io: TokioIo<T>,
        ctx: &Context,
        url: &Url,
        body: Bytes,
        content_type: Option<HeaderValue>,
    ) -> Result<Response>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
            .await
            .map_err(|e| Error::new(ErrorCode::Network, "http handshake failed").with_cause(e))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(target: "ika.transport", error = %err, "connection closed with error");
            }
        });

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut request = hyper::Request::builder()
            .method(ctx.method().clone())
            .uri(path)
            .body(Full::new(body))
            .map_err(|e| Error::new(ErrorCode::Network, "invalid http request").with_cause(e))?;
        *request.headers_mut() = ctx.headers().clone();
        if !request.headers().contains_key(HOST) {
            let authority = match url.port() {
                Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
                None => url.host_str().unwrap_or_default().to_string(),
            };
            let value = HeaderValue::from_str(&authority).map_err(|e| {
                Error::new(ErrorCode::UrlNormalizationFailed, "host is not a valid header value")
                    .with_cause(e)
            })?;
            request.headers_mut().insert(HOST, value);
        }
        if let Some(value) = content_type {
            if !request.headers().contains_key(CONTENT_TYPE) {
                request.headers_mut().insert(CONTENT_TYPE, value);
            }
        }

        let mut response = tokio::select! {
            _ = ctx.cancel_token().cancelled() => {
                return Err(Error::new(ErrorCode::Cancelled, "request cancelled"));
            }
            result = sender.send_request(request) => result
                .map_err(|e| Error::new(ErrorCode::Network, "http request failed").with_cause(e))?,
        };

        let mut collected = Vec::new();
        loop {
            let frame = tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    return Err(Error::new(ErrorCode::Cancelled, "request cancelled"));
                }
                frame = response.frame() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if let Some(chunk) = frame.data_ref() {
                        collected.extend_from_slice(chunk);
                    }
                }
                Some(Err(err)) => {
                    return Err(
                        Error::new(ErrorCode::Network, "failed to read response body").with_cause(err),
                    );
                }
                None => break,
            }
        }

        let status = response.status();
        let data = if collected.is_empty() {
            Payload::Empty
        } else {
            Payload::Bytes(Bytes::from(collected))
        };
        Ok(Response::new(status, data).with_headers(response.headers().clone()))
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn request(&self, ctx: &Context) -> Result<Response> {
        let url = Url::parse(ctx.url()).map_err(|e| {
            Error::new(
                ErrorCode::UrlNormalizationFailed,
                format!("malformed url `{}`", ctx.url()),
            )
            .with_cause(e)
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorCode::UrlNormalizationFailed, "url has no host"))?
            .to_string();
        let port = url.port_or_known_default().ok_or_else(|| {
            Error::new(ErrorCode::UrlNormalizationFailed, "url has no usable port")
        })?;

        let (body, content_type) = request_body(ctx)?;

        let stream = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            Error::new(ErrorCode::Network, format!("failed to connect to {host}:{port}"))
                .with_cause(e)
        })?;

        match url.scheme() {
            "http" => {
                self
                    .exchange(TokioIo::new(stream), ctx, &url, body, content_type)
                    .await
            }
            "https" => {
                let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                    Error::new(ErrorCode::Network, format!("invalid tls server name `{host}`"))
                        .with_cause(e)
                })?;
                let connector = TlsConnector::from(self.tls.clone());
                let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
                    Error::new(ErrorCode::Network, "tls handshake failed").with_cause(e)
                })?;
                self
                    .exchange(TokioIo::new(tls_stream), ctx, &url, body, content_type)
                    .await
            }
            other => Err(Error::new(
                ErrorCode::Network,
                format!("unsupported scheme `{other}` for the http connector"),
            )),
        }
    }
}

fn request_body(ctx: &Context) -> Result<(Bytes, Option<HeaderValue>)> {
    match ctx.body() {
        RequestBody::None => Ok((Bytes::new(), None)),
        RequestBody::Bytes(bytes) => Ok((bytes.clone(), None)),
        RequestBody::Text(text) => Ok((
            Bytes::from(text.clone()),
            Some(HeaderValue::from_static("text/plain; charset=utf-8")),
        )),
        RequestBody::Json(value) => {
            let bytes = serde_json::to_vec(value).map_err(|e| {
                Error::new(ErrorCode::Serialization, "failed to serialize json body").with_cause(e)
            })?;
            Ok((
                Bytes::from(bytes),
                Some(HeaderValue::from_static("application/json")),
            ))
        }
        RequestBody::Descriptor(descriptor) => {
            let bytes = descriptor.serialize()?;
            let value = descriptor
                .content_type
                .as_deref()
                .map(HeaderValue::from_str)
                .transpose()
                .map_err(|e| {
                    Error::new(ErrorCode::Validation, "descriptor content type is not a header value")
                        .with_cause(e)
                })?;
            Ok((bytes, value))
        }
        RequestBody::Form(_) => Err(Error::new(
            ErrorCode::Validation,
            "multipart bodies must be assembled by the multipart policy",
        )),
        RequestBody::Stream(_) => Err(Error::new(
            ErrorCode::Validation,
            "streaming request bodies are not supported by the http connector",
        )),
    }
}
