//! Tree model for patched documents.
//!
//! A minimal DOM-like tree: tagged elements with ordered attributes and
//! ordered children, plus text, comment and passthrough nodes. Structural
//! operations only — diffing lives in `diff`, splicing in `patch`.
//!
//! Traversals return [`ControlFlow`] so searches short-circuit without
//! non-local control transfer.

pub mod html;
pub mod parse;
pub mod render;
pub mod select;

use std::fmt;
use std::ops::ControlFlow;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

// =============================================================================
// Reserved Attributes
// =============================================================================

/// Marks the root element of a live session (mount/unmount scanning).
pub const SESSION_ATTR: &str = "data-wr-session";

/// Component-identity marker; value is the decimal component id.
pub const COMPONENT_ATTR: &str = "data-wr-component";

/// Stream-identity marker; value is the owning stream's ref.
pub const STREAM_ATTR: &str = "data-wr-stream";

/// Per-container update strategy (`replace`/`ignore`/`append`/`prepend`/`stream`).
pub const UPDATE_ATTR: &str = "wr-update";

/// Anchor navigation kind (`patch` or `redirect`).
pub const LINK_ATTR: &str = "data-wr-link";

/// Prefix of attributes allowed to flow onto an `ignore` container tag.
pub const DATA_PREFIX: &str = "data-";

/// Prefix of attributes contributing extra key/value pairs to click payloads.
pub const VALUE_PREFIX: &str = "wr-value-";

// =============================================================================
// Attrs
// =============================================================================

/// Ordered attribute list with unique names (last write wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(SmallVec<[(String, String); 8]>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an attribute value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check for presence regardless of value.
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Insert an attribute at the front (used for identity markers).
    pub fn insert_front(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| *n != name);
        self.0.insert(0, (name, value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Attrs {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut attrs = Attrs::new();
        for (n, v) in iter {
            attrs.set(n, v);
        }
        attrs
    }
}

// =============================================================================
// Node
// =============================================================================

/// An element node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attrs: Attrs,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            children: Vec::new(),
        }
    }

    /// The element's `id` attribute, if non-empty.
    pub fn id(&self) -> Option<&str> {
        self.attrs.get("id").filter(|v| !v.is_empty())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name)
    }

    /// Decimal component id from the identity marker, if present.
    pub fn component_id(&self) -> Option<i64> {
        self.attrs.get(COMPONENT_ATTR)?.parse().ok()
    }

    /// True when this container's internals are externally managed.
    pub fn is_ignored(&self) -> bool {
        self.attrs.get(UPDATE_ATTR) == Some("ignore")
    }

    /// True when this element roots a live session.
    pub fn is_session_root(&self) -> bool {
        self.attrs.has(SESSION_ATTR)
    }
}

/// A node in the document tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Box<Element>),
    Text(String),
    Comment(String),
    /// Passthrough for declarations (`<!doctype ...>` and friends); never transformed.
    Pi(String),
}

impl Node {
    pub fn element(tag: impl Into<String>) -> Self {
        Node::Element(Box::new(Element::new(tag)))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Node::Text(s.into())
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render::node_to_markup(self))
    }
}

// =============================================================================
// Traversal
// =============================================================================

/// Depth-first pre-order walk over a fragment, short-circuiting on `Break`.
pub fn walk<'a, B>(
    nodes: &'a [Node],
    visit: &mut impl FnMut(&'a Node) -> ControlFlow<B>,
) -> ControlFlow<B> {
    for node in nodes {
        visit(node)?;
        if let Node::Element(el) = node {
            walk(&el.children, visit)?;
        }
    }
    ControlFlow::Continue(())
}

/// Find the element with the given id.
pub fn by_id<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Element> {
    let found = walk(nodes, &mut |node| match node.as_element() {
        Some(el) if el.id() == Some(id) => ControlFlow::Break(el),
        _ => ControlFlow::Continue(()),
    });
    match found {
        ControlFlow::Break(el) => Some(el),
        ControlFlow::Continue(()) => None,
    }
}

/// Rebuild a fragment with the children of element `id` replaced.
///
/// Returns `None` when no element carries that id.
pub fn replace_inner(nodes: &[Node], id: &str, new_children: Vec<Node>) -> Option<Vec<Node>> {
    let mut replacement = Some(new_children);
    let out = replace_inner_walk(nodes, id, &mut replacement);
    if replacement.is_some() {
        return None; // target never found
    }
    Some(out)
}

fn replace_inner_walk(nodes: &[Node], id: &str, replacement: &mut Option<Vec<Node>>) -> Vec<Node> {
    nodes
        .iter()
        .map(|node| match node {
            Node::Element(el) => {
                let mut el = el.clone();
                if replacement.is_some() && el.id() == Some(id) {
                    el.children = replacement.take().unwrap_or_default();
                } else {
                    el.children = replace_inner_walk(&el.children, id, replacement);
                }
                Node::Element(el)
            }
            other => other.clone(),
        })
        .collect()
}

/// Component ids nested under a fragment, first-seen order.
///
/// Does not descend into `ignore` containers: their internals are opaque.
pub fn component_ids(nodes: &[Node]) -> Vec<i64> {
    let mut seen = FxHashSet::default();
    let mut ids = Vec::new();
    collect_cids(nodes, &mut seen, &mut ids);
    ids
}

fn collect_cids(nodes: &[Node], seen: &mut FxHashSet<i64>, ids: &mut Vec<i64>) {
    for node in nodes {
        let Some(el) = node.as_element() else { continue };
        if let Some(cid) = el.component_id()
            && seen.insert(cid)
        {
            ids.push(cid);
        }
        // Opaque subtrees: ignore containers are externally managed and a
        // nested session root's components belong to its own view.
        if !el.is_ignored() && !el.is_session_root() {
            collect_cids(&el.children, seen, ids);
        }
    }
}

/// Ids of live-session root elements in a fragment, document order.
pub fn session_root_ids(nodes: &[Node]) -> Vec<String> {
    let mut ids = Vec::new();
    let _: ControlFlow<()> = walk(nodes, &mut |node| {
        if let Some(el) = node.as_element()
            && el.is_session_root()
            && let Some(id) = el.id()
        {
            ids.push(id.to_string());
        }
        ControlFlow::Continue(())
    });
    ids
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Collaborator for non-fatal rendering-defect warnings.
pub trait DiagnosticSink: Send {
    fn warn(&self, message: &str);
}

/// Default sink: routes warnings through the crate logger.
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn warn(&self, message: &str) {
        crate::log!("warning"; "{message}");
    }
}

/// Report duplicate element ids and duplicate component markers.
///
/// Both indicate an upstream rendering defect that will misdirect future
/// patches; the document is left untouched. `ignore` containers are not
/// scanned — their internals are externally managed.
pub fn scan_duplicates(nodes: &[Node], sink: &dyn DiagnosticSink) {
    let mut ids: FxHashSet<&str> = FxHashSet::default();
    let mut cids: FxHashSet<i64> = FxHashSet::default();
    scan_duplicates_walk(nodes, sink, &mut ids, &mut cids);
}

fn scan_duplicates_walk<'a>(
    nodes: &'a [Node],
    sink: &dyn DiagnosticSink,
    ids: &mut FxHashSet<&'a str>,
    cids: &mut FxHashSet<i64>,
) {
    for node in nodes {
        let Some(el) = node.as_element() else { continue };
        if let Some(id) = el.id()
            && !ids.insert(id)
        {
            sink.warn(&format!(
                "duplicate id \"{id}\" found in document; \
                 future patches targeting it will be misdirected"
            ));
        }
        if let Some(cid) = el.component_id()
            && !cids.insert(cid)
        {
            sink.warn(&format!(
                "component {cid} is rendered more than once in the document"
            ));
        }
        if !el.is_ignored() {
            scan_duplicates_walk(&el.children, sink, ids, cids);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
