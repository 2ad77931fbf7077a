//! Response content-type dispatch (the Parser slot).
//!
//! Turns raw byte payloads into structured ones by content type:
//! `application/json` (and `+json` suffixes) parse into JSON, `text/*`
//! decodes into text. Anything else passes through untouched; deeper body
//! parsing is out of scope.
//!
//! With an `accept` list configured, the policy also sets the request
//! `Accept` header and rejects responses whose content type matches none of
//! the patterns (`type/*` matches by prefix) with `NOT_ACCEPTABLE`.

use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::context::Context;
use crate::error::{Error, ErrorCode};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::response::Payload;
use crate::slot::{Slot, SlotKind};

/// Parser-slot policy.
#[derive(Debug, Clone, Default)]
pub struct ParsePolicy {
    accept: Option<Vec<String>>,
}

impl ParsePolicy {
    /// Creates the policy with no content negotiation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts acceptable response content types.
    pub fn accept<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept = Some(patterns.into_iter().map(Into::into).collect());
        self
    }
}

fn matches_pattern(content_type: &str, pattern: &str) -> bool {
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

fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == mime::APPLICATION_JSON.essence_str() || essence.ends_with("+json")
}

fn is_text(content_type: &str) -> bool {
    matches_pattern(content_type, "text/*")
}

impl IntoPolicy for ParsePolicy {
    fn into_policy(self) -> Policy {
        let accept = self.accept.clone();
        let meta = Meta::new("parse", MetaKind::Other).with_option(
            "accept",
            serde_json::json!(self.accept.clone().unwrap_or_default()),
        );

        Policy::new(move |ctx: Context, next: Next| {
            let accept = accept.clone();
            async move {
                let ctx = match &accept {
                    Some(patterns) if !patterns.is_empty() => {
                        match HeaderValue::from_str(&patterns.join(", ")) {
                            Ok(value) => ctx.with_header_if_absent(ACCEPT, value),
                            Err(_) => ctx,
                        }
                    }
                    _ => ctx,
                };

                let response = next.run(ctx).await?;
                let Some(content_type) = response
                    .header_str(CONTENT_TYPE.as_str())
                    .map(str::to_string)
                else {
                    return Ok(response);
                };

                if let Some(patterns) = &accept {
                    if !patterns.is_empty()
                        && !patterns.iter().any(|p| matches_pattern(&content_type, p))
                    {
                        return Err(Error::new(
                            ErrorCode::NotAcceptable,
                            format!("response content type `{content_type}` is not acceptable"),
                        )
                        .with_status(response.status()));
                    }
                }

                let Payload::Bytes(bytes) = response.data() else {
                    return Ok(response);
                };
                if is_json(&content_type) {
                    let value: serde_json::Value =
                        serde_json::from_slice(bytes).map_err(|e| {
                            Error::new(
                                ErrorCode::Serialization,
                                "response declared json but failed to parse",
                            )
                            .with_cause(e)
                        })?;
                    return Ok(response.with_data(Payload::Json(value)));
                }
                if is_text(&content_type) {
                    let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                        Error::new(
                            ErrorCode::Serialization,
                            "response declared text but is not valid utf-8",
                        )
                        .with_cause(e)
                    })?;
                    return Ok(response.with_data(Payload::Text(text)));
                }
                Ok(response)
            }
        })
        .with_slot(Slot::new(SlotKind::Parser, "parse"))
        .with_meta(meta)
    }
}
