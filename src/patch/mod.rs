//! Stateful tree patcher.
//!
//! Splices freshly rendered inner content into the live document, honoring
//! per-container update strategies, and reports which nested components
//! disappeared. Containers transform bottom-up: children are settled before
//! the container that declares a strategy on itself.
//!
//! Strategies (`wr-update`):
//! - `replace` (default): substitute children wholesale
//! - `ignore`: the existing children are externally managed; only `data-*`
//!   attributes flow onto the container tag
//! - `append` / `prepend`: legacy id-deduplicating edge insertion
//! - `stream`: keyed reconciliation against extracted stream ops

mod stream;

use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::diff::StreamOp;
use crate::dom::{
    DATA_PREFIX, DiagnosticSink, Element, Node, UPDATE_ATTR, by_id, component_ids, replace_inner,
    scan_duplicates,
};

// =============================================================================
// Errors
// =============================================================================

/// Fatal configuration errors; abort the patch before any splice.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unknown {UPDATE_ATTR} value {value:?} on container {id:?}")]
    UnknownStrategy { value: String, id: String },

    #[error("container with {UPDATE_ATTR}={strategy:?} requires a non-empty id")]
    MissingContainerId { strategy: &'static str },

    #[error("child of stream container {container:?} is missing an id")]
    StreamChildWithoutId { container: String },

    #[error("patch target {0:?} was not found in the document")]
    TargetMissing(String),
}

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Replace,
    Ignore,
    Append,
    Prepend,
    Stream,
}

impl Strategy {
    fn of(el: &Element) -> Result<Self, PatchError> {
        match el.attr(UPDATE_ATTR) {
            None | Some("") | Some("replace") => Ok(Self::Replace),
            Some("ignore") => Ok(Self::Ignore),
            Some("append") => Ok(Self::Append),
            Some("prepend") => Ok(Self::Prepend),
            Some("stream") => Ok(Self::Stream),
            Some(other) => Err(PatchError::UnknownStrategy {
                value: other.to_string(),
                id: el.id().unwrap_or_default().to_string(),
            }),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Ignore => "ignore",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Stream => "stream",
        }
    }
}

// =============================================================================
// Patch
// =============================================================================

/// Result of one patch application.
#[derive(Debug)]
pub struct PatchOutcome {
    pub document: Vec<Node>,
    /// Component ids present under the target before the patch but not
    /// after, in first-seen order. Speculative: confirm before evicting.
    pub destroyed_cids: Vec<i64>,
}

/// Splice `new_inner` as the children of `target_id` in a copy of
/// `document`.
///
/// `streams` are the ops extracted by the most recent merge. When a
/// diagnostic sink is supplied, the patched document is scanned for
/// duplicate ids and duplicate component markers (reported, never fatal).
pub fn patch(
    document: &[Node],
    target_id: &str,
    new_inner: Vec<Node>,
    streams: &[StreamOp],
    sink: Option<&dyn DiagnosticSink>,
) -> Result<PatchOutcome, PatchError> {
    let target =
        by_id(document, target_id).ok_or_else(|| PatchError::TargetMissing(target_id.to_string()))?;
    let cids_before = component_ids(&target.children);

    let transformed = transform_fragment(new_inner, document, streams)?;

    let patched = replace_inner(document, target_id, transformed)
        .ok_or_else(|| PatchError::TargetMissing(target_id.to_string()))?;

    let cids_after: FxHashSet<i64> = by_id(&patched, target_id)
        .map(|el| component_ids(&el.children))
        .unwrap_or_default()
        .into_iter()
        .collect();
    let destroyed_cids = cids_before
        .into_iter()
        .filter(|cid| !cids_after.contains(cid))
        .collect();

    if let Some(sink) = sink {
        scan_duplicates(&patched, sink);
    }

    Ok(PatchOutcome {
        document: patched,
        destroyed_cids,
    })
}

fn transform_fragment(
    nodes: Vec<Node>,
    document: &[Node],
    streams: &[StreamOp],
) -> Result<Vec<Node>, PatchError> {
    nodes
        .into_iter()
        .map(|node| transform_node(node, document, streams))
        .collect()
}

fn transform_node(node: Node, document: &[Node], streams: &[StreamOp]) -> Result<Node, PatchError> {
    let Node::Element(mut el) = node else {
        return Ok(node);
    };

    // A mounted child view owns its subtree: the parent's rendered
    // placeholder never overwrites it. Handled like `ignore`, keyed on the
    // session marker.
    if el.is_session_root()
        && let Some(id) = el.id()
        && let Some(old) = by_id(document, id)
        && old.is_session_root()
    {
        let mut merged = old.clone();
        for (name, value) in el.attrs.iter() {
            if name.starts_with(DATA_PREFIX) {
                merged.attrs.set(name, value);
            }
        }
        return Ok(Node::Element(Box::new(merged)));
    }

    // Bottom-up: settle descendants before this container's own strategy.
    el.children = transform_fragment(std::mem::take(&mut el.children), document, streams)?;

    match Strategy::of(&el)? {
        Strategy::Replace => Ok(Node::Element(el)),
        Strategy::Ignore => apply_ignore(el, document),
        Strategy::Append => apply_legacy(el, document, Strategy::Append),
        Strategy::Prepend => apply_legacy(el, document, Strategy::Prepend),
        Strategy::Stream => stream::apply(el, document, streams),
    }
}

fn required_id(el: &Element, strategy: Strategy) -> Result<String, PatchError> {
    el.id()
        .map(str::to_string)
        .ok_or(PatchError::MissingContainerId {
            strategy: strategy.name(),
        })
}

/// `ignore`: the document's children stay untouched; only `data-*`
/// attributes transfer from the new tag, everything else is preserved from
/// the old one.
fn apply_ignore(new_el: Box<Element>, document: &[Node]) -> Result<Node, PatchError> {
    let id = required_id(&new_el, Strategy::Ignore)?;
    let Some(old) = by_id(document, &id) else {
        // First render of the container; nothing to preserve yet.
        return Ok(Node::Element(new_el));
    };

    let mut merged = old.clone();
    for (name, value) in new_el.attrs.iter() {
        if name.starts_with(DATA_PREFIX) {
            merged.attrs.set(name, value);
        }
    }
    Ok(Node::Element(Box::new(merged)))
}

/// Legacy `append`/`prepend`: ids present in both old and new update in
/// place; genuinely new children attach at the declared edge.
fn apply_legacy(
    mut new_el: Box<Element>,
    document: &[Node],
    strategy: Strategy,
) -> Result<Node, PatchError> {
    let id = required_id(&new_el, strategy)?;
    let Some(old) = by_id(document, &id) else {
        return Ok(Node::Element(new_el));
    };

    let old_ids = child_ids(&old.children);
    let new_ids = child_ids(&new_el.children);
    if old_ids == new_ids {
        // Identical id lists: the server already sent them in final order.
        return Ok(Node::Element(new_el));
    }

    let old_id_set: FxHashSet<&str> = old_ids.iter().flatten().copied().collect();

    let mut updates: Vec<(String, Node)> = Vec::new();
    let mut additions: Vec<Node> = Vec::new();
    for child in new_el.children.drain(..) {
        let update_id = child
            .as_element()
            .and_then(Element::id)
            .filter(|id| old_id_set.contains(id))
            .map(str::to_string);
        match update_id {
            Some(child_id) => updates.push((child_id, child)),
            None => additions.push(child),
        }
    }

    let mut kept: Vec<Node> = Vec::with_capacity(old.children.len());
    for child in &old.children {
        let update = child
            .as_element()
            .and_then(Element::id)
            .and_then(|child_id| {
                updates
                    .iter()
                    .position(|(id, _)| id == child_id)
                    .map(|i| updates.remove(i).1)
            });
        kept.push(update.unwrap_or_else(|| child.clone()));
    }

    new_el.children = match strategy {
        Strategy::Prepend => {
            additions.extend(kept);
            additions
        }
        _ => {
            kept.extend(additions);
            kept
        }
    };
    Ok(Node::Element(new_el))
}

fn child_ids(children: &[Node]) -> Vec<Option<&str>> {
    children
        .iter()
        .filter_map(Node::as_element)
        .map(Element::id)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
