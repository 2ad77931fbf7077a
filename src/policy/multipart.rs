//! Multipart form assembly with upload hygiene.
//!
//! Turns a [`MultipartForm`] body into `multipart/form-data` bytes with a
//! random boundary, enforcing:
//! - filename sanitization (default on): path separators collapse to `_`,
//!   null bytes are stripped, `..` becomes `__`;
//! - a per-file size limit: strictly larger than `max_file_size` is
//!   rejected, equal is permitted;
//! - an optional MIME allowlist where a `type/*` pattern matches by prefix.
//!   An empty allowlist logs a security warning and permits everything.
//!
//! Non-form bodies pass through. Streaming parts are not supported; callers
//! materialize to bytes first.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use serde_json::json;
use uuid::Uuid;

use crate::body::{MultipartForm, RequestBody};
use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::slot::{Slot, SlotKind};

/// Assembly configuration.
#[derive(Clone)]
pub struct Config {
    /// Per-file byte cap. Default: 10 MiB.
    pub max_file_size: usize,
    /// MIME allowlist; `None` disables the check, `Some(empty)` warns and
    /// permits everything.
    pub allowed_types: Option<Vec<String>>,
    /// Whether filenames are sanitized. Default: true.
    pub sanitize_filenames: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            allowed_types: None,
            sanitize_filenames: true,
        }
    }
}

/// Builder for the multipart policy.
pub struct MultipartBuilder(Config);

impl MultipartBuilder {
    /// Starts from defaults.
    pub fn new() -> Self {
        Self(Config::default())
    }

    /// Sets the per-file byte cap.
    pub fn max_file_size(mut self, bytes: usize) -> Self {
        self.0.max_file_size = bytes;
        self
    }

    /// Sets the MIME allowlist.
    pub fn allowed_types<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.allowed_types = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Enables or disables filename sanitization.
    pub fn sanitize_filenames(mut self, yes: bool) -> Self {
        self.0.sanitize_filenames = yes;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> MultipartPolicy {
        MultipartPolicy { cfg: self.0 }
    }
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Multipart assembly policy; convert with [`IntoPolicy`].
pub struct MultipartPolicy {
    cfg: Config,
}

impl MultipartPolicy {
    /// Starts a builder.
    pub fn builder() -> MultipartBuilder {
        MultipartBuilder::new()
    }
}

impl IntoPolicy for MultipartPolicy {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("multipart", MetaKind::Other)
            .with_option("max_file_size", json!(self.cfg.max_file_size))
            .with_option("sanitize", json!(self.cfg.sanitize_filenames));
        let cfg = self.cfg;

        Policy::new(move |ctx: Context, next: Next| {
            let cfg = cfg.clone();
            async move {
                let RequestBody::Form(form) = ctx.body() else {
                    return next.run(ctx).await;
                };
                let form = form.clone();
                let (bytes, content_type) = assemble(&form, &cfg)?;
                let value = HeaderValue::from_str(&content_type).map_err(|e| {
                    Error::new(ErrorCode::Validation, "invalid multipart content type").with_cause(e)
                })?;
                let ctx = ctx
                    .with_body(RequestBody::Bytes(bytes))
                    .with_header(CONTENT_TYPE, value);
                next.run(ctx).await
            }
        })
        .with_slot(Slot::new(SlotKind::Other, "multipart"))
        .with_meta(meta)
    }
}

fn assemble(form: &MultipartForm, cfg: &Config) -> Result<(Bytes, String)> {
    if let Some(allowed) = &cfg.allowed_types {
        if allowed.is_empty() {
            tracing::warn!(
                target: "ika.multipart",
                "empty MIME allowlist: every content type will be accepted"
            );
        }
    }

    let boundary = format!("----ika-{}", Uuid::new_v4().simple());
    let mut out: Vec<u8> = Vec::new();

    for field in &form.fields {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(&field.name)
            )
            .as_bytes(),
        );
        out.extend_from_slice(field.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    for file in &form.files {
        if file.data.len() > cfg.max_file_size {
            return Err(
                Error::new(
                    ErrorCode::Validation,
                    format!(
                        "file `{}` is {} bytes, above the {} byte limit",
                        file.filename,
                        file.data.len(),
                        cfg.max_file_size
                    ),
                )
                .with_context("field", file.name.clone()),
            );
        }
        if let Some(allowed) = &cfg.allowed_types {
            if !allowed.is_empty() && !allowed.iter().any(|p| mime_matches(&file.content_type, p)) {
                return Err(
                    Error::new(
                        ErrorCode::Validation,
                        format!(
                            "content type `{}` of `{}` is not in the allowlist",
                            file.content_type, file.filename
                        ),
                    )
                    .with_context("field", file.name.clone()),
                );
            }
        }

        let filename = if cfg.sanitize_filenames {
            sanitize_filename(&file.filename)
        } else {
            file.filename.clone()
        };

        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                escape_quotes(&file.name),
                escape_quotes(&filename)
            )
            .as_bytes(),
        );
        out.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.content_type).as_bytes());
        out.extend_from_slice(&file.data);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    let content_type = format!("multipart/form-data; boundary={boundary}");
    Ok((Bytes::from(out), content_type))
}

/// Collapses path separators, strips null bytes, and defuses `..`.
pub fn sanitize_filename(name: &str) -> String {
    let collapsed: String = name
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    collapsed.replace("..", "__")
}

fn mime_matches(content_type: &str, pattern: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_suffix("/*") {
        Some(prefix) => essence.starts_with(&format!("{prefix}/")),
        None => essence == pattern,
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::Arc;

    use crate::policy::Chain;
    use crate::response::{Payload, Response};

    fn capture() -> (Arc<parking_lot::Mutex<Vec<Context>>>, Policy) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let terminal = Policy::new(move |ctx: Context, _next: Next| {
            let seen = seen_inner.clone();
            async move {
                seen.lock().push(ctx);
                Ok(Response::new(StatusCode::OK, Payload::Empty))
            }
        });
        (seen, terminal)
    }

    fn form_ctx(form: MultipartForm) -> Context {
        Context::new(Method::POST, "https://example.com/upload").with_body(RequestBody::Form(form))
    }

    #[tokio::test]
    async fn assembles_fields_and_files_with_one_boundary() {
        let (seen, terminal) = capture();
        let chain = Chain::new(vec![
            MultipartPolicy::builder().build().into_policy(),
            terminal,
        ]);
        let form = MultipartForm::new()
            .field("kind", "avatar")
            .file("file", "me.png", "image/png", vec![1u8, 2, 3]);

        chain.execute(form_ctx(form)).await.unwrap();
        let seen = seen.lock();
        let content_type = seen[0].header_str("content-type").unwrap().to_string();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_string();
        let RequestBody::Bytes(bytes) = seen[0].body() else {
            panic!("expected assembled bytes");
        };
        let text = String::from_utf8_lossy(bytes);
        assert!(text.contains(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"kind\""));
        assert!(text.contains("filename=\"me.png\""));
        assert!(text.contains("Content-Type: image/png"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn oversized_files_are_rejected_but_equal_is_permitted() {
        let (_seen, terminal) = capture();
        let chain = Chain::new(vec![
            MultipartPolicy::builder().max_file_size(3).build().into_policy(),
            terminal,
        ]);

        let equal = MultipartForm::new().file("f", "a.bin", "application/octet-stream", vec![0u8; 3]);
        assert!(chain.execute(form_ctx(equal)).await.is_ok());

        let over = MultipartForm::new().file("f", "a.bin", "application/octet-stream", vec![0u8; 4]);
        let err = chain.execute(form_ctx(over)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn allowlist_prefix_patterns_match() {
        let (_seen, terminal) = capture();
        let chain = Chain::new(vec![
            MultipartPolicy::builder()
                .allowed_types(["image/*", "application/pdf"])
                .build()
                .into_policy(),
            terminal,
        ]);

        let image = MultipartForm::new().file("f", "a.png", "image/png", vec![1u8]);
        assert!(chain.execute(form_ctx(image)).await.is_ok());

        let archive = MultipartForm::new().file("f", "a.zip", "application/zip", vec![1u8]);
        let err = chain.execute(form_ctx(archive)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("nul\0l.txt"), "null.txt");
        assert_eq!(sanitize_filename("..secret"), "__secret");
    }
}
