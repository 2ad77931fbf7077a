//! Slot metadata and the build-time chain validator.
//!
//! Slots give policies a typed role so a chain's structure can be checked
//! once, when the client is built, instead of failing mid-request. The
//! validator enforces:
//!
//! 1. No two policies share a `(kind, name)` pair (`DUPLICATE_POLICY`).
//! 2. A transport slot, if present, is last (`INVALID_SLOT`).
//! 3. Every auth slot precedes every parser slot (`INVALID_SLOT`).
//! 4. Declared `required_capabilities` are advertised (truthy) by the
//!    transport (`MISSING_CAPABILITY`).
//!
//! Policies without slot metadata are ignored by these checks.

use std::collections::HashSet;

use crate::error::{Error, ErrorCode, Result};
use crate::policy::Policy;
use crate::transport::Capabilities;

/// Typed role a policy plays in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Credential injection.
    Auth,
    /// Chain terminator performing I/O.
    Transport,
    /// Response body interpretation.
    Parser,
    /// Attempt loops.
    Retry,
    /// Response or single-flight caching.
    Cache,
    /// Anything else that still wants uniqueness checks.
    Other,
}

impl SlotKind {
    /// Lowercase tag used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::Parser => "parser",
            Self::Retry => "retry",
            Self::Cache => "cache",
            Self::Other => "other",
        }
    }
}

/// Slot record attached to a policy.
#[derive(Debug, Clone)]
pub struct Slot {
    /// The typed role.
    pub kind: SlotKind,
    /// Name distinguishing several policies of the same kind.
    pub name: String,
    /// Capability flags the transport must advertise.
    pub required_capabilities: Vec<String>,
}

impl Slot {
    /// Creates a slot record.
    pub fn new(kind: SlotKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            required_capabilities: Vec::new(),
        }
    }

    /// Declares a required transport capability.
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }
}

/// Validates a chain against the transport's capability flags.
///
/// Invoked once when a client is built; per-request execution assumes the
/// chain already passed.
pub fn validate(policies: &[Policy], capabilities: &Capabilities) -> Result<()> {
    let mut seen: HashSet<(SlotKind, &str)> = HashSet::new();
    let mut first_parser: Option<usize> = None;
    let last = policies.len().saturating_sub(1);

    for (index, policy) in policies.iter().enumerate() {
        let Some(slot) = policy.slot() else {
            continue;
        };

        if !seen.insert((slot.kind, slot.name.as_str())) {
            return Err(Error::new(
                ErrorCode::DuplicatePolicy,
                format!(
                    "duplicate policy slot ({}, {})",
                    slot.kind.as_str(),
                    slot.name
                ),
            ));
        }

        if slot.kind == SlotKind::Transport && index != last {
            return Err(Error::new(
                ErrorCode::InvalidSlot,
                format!(
                    "transport slot `{}` must occupy the final position (found at {index})",
                    slot.name
                ),
            ));
        }

        if slot.kind == SlotKind::Parser && first_parser.is_none() {
            first_parser = Some(index);
        }
        if slot.kind == SlotKind::Auth {
            if let Some(parser_index) = first_parser {
                return Err(Error::new(
                    ErrorCode::InvalidSlot,
                    format!(
                        "auth slot `{}` must precede parser slots (parser at {parser_index})",
                        slot.name
                    ),
                ));
            }
        }

        for capability in &slot.required_capabilities {
            if !capabilities.supports(capability) {
                return Err(Error::new(
                    ErrorCode::MissingCapability,
                    format!(
                        "policy `{}` requires capability `{capability}` the transport lacks",
                        slot.name
                    ),
                )
                .with_context("capability", capability.clone()));
            }
        }
    }

    Ok(())
}
