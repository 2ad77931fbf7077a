//! Structured metadata attached to policies and strategies for debugging.
//!
//! Composite constructors (`compose`, the retry policy) gather their
//! arguments' metadata into `children`, forming a tree that inspectors render
//! without reflecting on runtime types. Ids come from a process-wide monotonic
//! counter, so two taggings never collide.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Broad role a tagged component plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    /// Authentication policies.
    Auth,
    /// Retry loops.
    Retry,
    /// Delay strategies.
    Strategy,
    /// Retry predicates.
    Predicate,
    /// Caching policies (response cache, dedupe).
    Cache,
    /// Everything else.
    Other,
}

impl MetaKind {
    /// Lowercase tag used in rendered trees.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Retry => "retry",
            Self::Strategy => "strategy",
            Self::Predicate => "predicate",
            Self::Cache => "cache",
            Self::Other => "other",
        }
    }
}

/// Metadata record carried by a policy, predicate, or strategy.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Monotonic id assigned at tagging time.
    pub id: u64,
    /// Human-readable component name.
    pub name: String,
    /// Component role.
    pub kind: MetaKind,
    /// Configuration snapshot (plain JSON, no live references).
    pub options: Map<String, Value>,
    /// Metadata of nested components.
    pub children: Vec<Meta>,
}

impl Meta {
    /// Tags a component, drawing a fresh id.
    pub fn new(name: impl Into<String>, kind: MetaKind) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind,
            options: Map::new(),
            children: Vec::new(),
        }
    }

    /// Records a configuration option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Appends one child record.
    pub fn with_child(mut self, child: Meta) -> Self {
        self.children.push(child);
        self
    }

    /// Appends several child records.
    pub fn with_children(mut self, children: impl IntoIterator<Item = Meta>) -> Self {
        self.children.extend(children);
        self
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        write!(f, "{indent}{} [{}#{}]", self.name, self.kind.as_str(), self.id)?;
        if !self.options.is_empty() {
            let opts: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " {{{}}}", opts.join(", "))?;
        }
        for child in &self.children {
            writeln!(f)?;
            child.render(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}
