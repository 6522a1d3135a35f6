//! Diff payload model and wire decoding.
//!
//! Server-pushed diffs arrive as JSON and are decoded once, here, into
//! typed structs; raw `serde_json::Value` never reaches the merge engine.
//!
//! Two families of types:
//! - [`Rendered`] is the accumulated, fully-resolved state of a view:
//!   statics plus a dense body of dynamics. Mutated in place by every merge.
//! - [`RootDiff`] / [`DiffNode`] are the sparse wire form: optional statics
//!   (possibly a template or share back-reference), sparse slot updates,
//!   comprehension entries, keyed ops, stream ops, component sub-diffs.
//!
//! Reserved wire keys: `s` statics, `d` comprehension entries, `p` template
//! table, `k` keyed block (`kc` count inside), `stream` stream op, `c`
//! component table, `t` page title. Unknown keys are ignored with a debug
//! log so newer servers stay compatible.

pub mod merge;
pub mod render;

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed diff payload: {0}")]
    Decode(String),

    #[error("template reference {0} has no entry in the template table")]
    UnknownTemplate(usize),

    #[error("statics reference left unresolved outside a component diff")]
    UnresolvedStatics,

    #[error("diff for component {0} is missing from the component table")]
    MissingComponent(i64),

    #[error("component {0} shares statics with old component {1}, which does not exist")]
    MissingOldComponent(i64, i64),

    #[error("component {0} participates in a static share cycle")]
    CyclicShare(i64),

    #[error("diff node with fresh statics is incomplete: slot {index} is missing")]
    IncompleteNode { index: usize },

    #[error("diff targets slot {index} but the node has {len} slots")]
    SlotOutOfRange { index: usize, len: usize },

    #[error("keyed diff references position {index} but only {len} items exist")]
    KeyedOutOfRange { index: usize, len: usize },

    #[error("diff shape mismatch: {0}")]
    Shape(&'static str),

    #[error("rendered node is corrupt: {len} dynamics for {statics} static fragments")]
    Arity { len: usize, statics: usize },

    #[error(transparent)]
    Markup(#[from] crate::dom::parse::ParseError),
}

// =============================================================================
// Accumulated State
// =============================================================================

/// One dynamic slot of a rendered container.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Literal markup or text (already server-escaped).
    Literal(String),
    /// Reference into the shared component table.
    Component(i64),
    /// Nested rendered container.
    Nested(Box<Rendered>),
}

/// The dynamic body of a rendered container.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// One dynamic per gap between static fragments.
    Slots(Vec<Slot>),
    /// Repeated per-item dynamics sharing the statics (comprehension or
    /// keyed list; the two render identically, they differ in how diffs
    /// address them).
    Items(Vec<Vec<Slot>>),
}

/// A fully-resolved rendered container.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Static fragments; always one more than the dynamics they surround.
    pub statics: Vec<String>,
    pub body: Body,
}

impl Default for Rendered {
    fn default() -> Self {
        Self {
            statics: vec![String::new()],
            body: Body::Slots(Vec::new()),
        }
    }
}

/// The accumulated state of one view: root container, shared component
/// table, and the stream ops extracted by the most recent merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedTree {
    pub root: Rendered,
    pub components: FxHashMap<i64, Rendered>,
    /// Transient: one merge-cycle lived, replaced wholesale each merge.
    pub streams: Vec<StreamOp>,
}

// =============================================================================
// Wire Form
// =============================================================================

/// Statics of a diff node: resolved fragments or a numeric back-reference.
///
/// A `Ref` is a template index when a template table is in scope, or a
/// component share (positive = new component, negative = old) at the top of
/// a component diff. Interpretation happens during merge.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticsRef {
    Fragments(Vec<String>),
    Ref(i64),
}

/// One dynamic slot in a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotDiff {
    Literal(String),
    Component(i64),
    Node(DiffNode),
}

/// Per-item dynamics map of a keyed item diff.
pub type ItemDiff = BTreeMap<usize, SlotDiff>;

/// One position of a keyed block diff.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyedOp {
    /// Keep the old item at this position (`null` on the wire).
    Keep,
    /// Move the old item from another position.
    Move(usize),
    /// Deep-merge onto the old item at this position (or a full new item).
    Patch(ItemDiff),
    /// Move the old item from `0` then deep-merge `1` onto it.
    MovePatch(usize, ItemDiff),
}

/// A keyed block: positionally addressed, order-preserving comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedDiff {
    /// Authoritative item count; positions beyond it are dropped.
    pub count: usize,
    /// Sparse ops; absent positions keep the old item.
    pub entries: BTreeMap<usize, KeyedOp>,
}

/// A sparse diff node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffNode {
    pub statics: Option<StaticsRef>,
    /// Sparse slot updates, keyed by slot index.
    pub slots: BTreeMap<usize, SlotDiff>,
    /// Comprehension entries; replaces the whole item list when present.
    pub entries: Option<Vec<Vec<SlotDiff>>>,
    /// Template table deduplicating statics across sibling instances.
    pub templates: Option<FxHashMap<usize, Vec<String>>>,
    pub keyed: Option<KeyedDiff>,
    pub stream: Option<StreamOp>,
}

impl DiffNode {
    pub fn is_empty(&self) -> bool {
        self.statics.is_none()
            && self.slots.is_empty()
            && self.entries.is_none()
            && self.templates.is_none()
            && self.keyed.is_none()
            && self.stream.is_none()
    }
}

/// A decoded top-level diff payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RootDiff {
    pub node: DiffNode,
    pub components: FxHashMap<i64, DiffNode>,
    pub title: Option<String>,
}

impl RootDiff {
    /// True when merging this diff cannot change anything; callers skip the
    /// downstream render+patch entirely for empty diffs.
    pub fn is_empty(&self) -> bool {
        self.node.is_empty() && self.components.is_empty() && self.title.is_none()
    }
}

// =============================================================================
// Stream Operations
// =============================================================================

/// A single stream insert declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInsert {
    pub id: String,
    /// Insert position in the already-filtered child list; `-1` appends.
    pub at: i64,
    /// Signed truncation: positive keeps the first N children, negative the
    /// last |N|.
    pub limit: Option<i64>,
    /// Never materialize the child when its id is absent.
    pub update_only: bool,
}

/// One stream operation record, extracted during merge.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOp {
    pub stream_ref: String,
    pub inserts: Vec<StreamInsert>,
    pub delete_ids: Vec<String>,
    pub reset: bool,
}

// =============================================================================
// Decoding
// =============================================================================

impl RootDiff {
    /// Decode a top-level wire payload.
    pub fn decode(value: &Value) -> Result<Self, DiffError> {
        let Value::Object(map) = value else {
            return Err(DiffError::Decode(format!(
                "expected top-level object, got {value}"
            )));
        };

        let mut root = RootDiff::default();
        let mut node_map = serde_json::Map::new();
        for (key, value) in map {
            match key.as_str() {
                "c" => root.components = decode_components(value)?,
                "t" => {
                    root.title = Some(as_string(value, "title")?);
                }
                "e" | "r" => {
                    // Reply metadata and queued events are transport-level;
                    // nothing in the tree depends on them.
                }
                _ => {
                    node_map.insert(key.clone(), value.clone());
                }
            }
        }
        root.node = decode_node(&Value::Object(node_map))?;
        Ok(root)
    }
}

fn decode_components(value: &Value) -> Result<FxHashMap<i64, DiffNode>, DiffError> {
    let Value::Object(map) = value else {
        return Err(DiffError::Decode(format!(
            "component table must be an object, got {value}"
        )));
    };
    let mut components = FxHashMap::default();
    for (key, value) in map {
        let cid: i64 = key
            .parse()
            .map_err(|_| DiffError::Decode(format!("component id {key:?} is not an integer")))?;
        if cid <= 0 {
            return Err(DiffError::Decode(format!(
                "component id {cid} must be positive"
            )));
        }
        components.insert(cid, decode_node(value)?);
    }
    Ok(components)
}

/// Decode one diff node from a JSON object.
pub fn decode_node(value: &Value) -> Result<DiffNode, DiffError> {
    let Value::Object(map) = value else {
        return Err(DiffError::Decode(format!(
            "expected diff node object, got {value}"
        )));
    };

    let mut node = DiffNode::default();
    for (key, value) in map {
        match key.as_str() {
            "s" => node.statics = Some(decode_statics(value)?),
            "d" => node.entries = Some(decode_entries(value)?),
            "p" => node.templates = Some(decode_templates(value)?),
            "k" => node.keyed = Some(decode_keyed(value)?),
            "stream" => node.stream = Some(decode_stream(value)?),
            _ => match key.parse::<usize>() {
                Ok(index) => {
                    node.slots.insert(index, decode_slot(value)?);
                }
                Err(_) => {
                    crate::debug!("diff"; "ignoring unknown diff key {key:?}");
                }
            },
        }
    }
    Ok(node)
}

fn decode_statics(value: &Value) -> Result<StaticsRef, DiffError> {
    match value {
        Value::Array(items) => {
            let fragments = items
                .iter()
                .map(|v| as_string(v, "static fragment"))
                .collect::<Result<Vec<_>, _>>()?;
            if fragments.is_empty() {
                return Err(DiffError::Decode("statics array is empty".to_string()));
            }
            Ok(StaticsRef::Fragments(fragments))
        }
        Value::Number(n) => n
            .as_i64()
            .map(StaticsRef::Ref)
            .ok_or_else(|| DiffError::Decode(format!("statics reference {n} is not an integer"))),
        other => Err(DiffError::Decode(format!(
            "statics must be an array or integer, got {other}"
        ))),
    }
}

fn decode_slot(value: &Value) -> Result<SlotDiff, DiffError> {
    match value {
        Value::String(s) => Ok(SlotDiff::Literal(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(SlotDiff::Component)
            .ok_or_else(|| DiffError::Decode(format!("component reference {n} is not an integer"))),
        Value::Object(_) => Ok(SlotDiff::Node(decode_node(value)?)),
        other => Err(DiffError::Decode(format!(
            "dynamic slot must be a string, integer or object, got {other}"
        ))),
    }
}

fn decode_entries(value: &Value) -> Result<Vec<Vec<SlotDiff>>, DiffError> {
    let Value::Array(items) = value else {
        return Err(DiffError::Decode(format!(
            "comprehension entries must be an array, got {value}"
        )));
    };
    items
        .iter()
        .map(|item| {
            let Value::Array(slots) = item else {
                return Err(DiffError::Decode(format!(
                    "comprehension entry must be an array, got {item}"
                )));
            };
            slots.iter().map(decode_slot).collect()
        })
        .collect()
}

fn decode_templates(value: &Value) -> Result<FxHashMap<usize, Vec<String>>, DiffError> {
    let Value::Object(map) = value else {
        return Err(DiffError::Decode(format!(
            "template table must be an object, got {value}"
        )));
    };
    let mut templates = FxHashMap::default();
    for (key, value) in map {
        let index: usize = key
            .parse()
            .map_err(|_| DiffError::Decode(format!("template index {key:?} is not an integer")))?;
        match decode_statics(value)? {
            StaticsRef::Fragments(fragments) => {
                templates.insert(index, fragments);
            }
            StaticsRef::Ref(_) => {
                return Err(DiffError::Decode(format!(
                    "template {index} must hold a statics array"
                )));
            }
        }
    }
    Ok(templates)
}

fn decode_keyed(value: &Value) -> Result<KeyedDiff, DiffError> {
    let Value::Object(map) = value else {
        return Err(DiffError::Decode(format!(
            "keyed block must be an object, got {value}"
        )));
    };

    let mut count = None;
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        if key == "kc" {
            count = Some(as_usize(value, "keyed count")?);
            continue;
        }
        let position: usize = key
            .parse()
            .map_err(|_| DiffError::Decode(format!("keyed position {key:?} is not an integer")))?;
        entries.insert(position, decode_keyed_op(value)?);
    }

    let count =
        count.ok_or_else(|| DiffError::Decode("keyed block is missing its count".to_string()))?;
    Ok(KeyedDiff { count, entries })
}

fn decode_keyed_op(value: &Value) -> Result<KeyedOp, DiffError> {
    match value {
        Value::Null => Ok(KeyedOp::Keep),
        Value::Number(n) => n
            .as_u64()
            .map(|from| KeyedOp::Move(from as usize))
            .ok_or_else(|| DiffError::Decode(format!("keyed move source {n} is not a position"))),
        Value::Object(_) => Ok(KeyedOp::Patch(decode_item(value)?)),
        Value::Array(pair) => match pair.as_slice() {
            [from, patch] => Ok(KeyedOp::MovePatch(
                as_usize(from, "keyed move source")?,
                decode_item(patch)?,
            )),
            _ => Err(DiffError::Decode(format!(
                "keyed move-with-patch must be a [position, diff] pair, got {value}"
            ))),
        },
        other => Err(DiffError::Decode(format!(
            "keyed op must be null, integer, object or pair, got {other}"
        ))),
    }
}

fn decode_item(value: &Value) -> Result<ItemDiff, DiffError> {
    let Value::Object(map) = value else {
        return Err(DiffError::Decode(format!(
            "keyed item diff must be an object, got {value}"
        )));
    };
    let mut item = BTreeMap::new();
    for (key, value) in map {
        let index: usize = key.parse().map_err(|_| {
            DiffError::Decode(format!("keyed item slot {key:?} is not an integer"))
        })?;
        item.insert(index, decode_slot(value)?);
    }
    Ok(item)
}

fn decode_stream(value: &Value) -> Result<StreamOp, DiffError> {
    let Value::Array(parts) = value else {
        return Err(DiffError::Decode(format!(
            "stream op must be an array, got {value}"
        )));
    };
    let (stream_ref, inserts, delete_ids, reset) = match parts.as_slice() {
        [r, i, d] => (r, i, d, false),
        [r, i, d, reset] => (r, i, d, reset.as_bool().unwrap_or(false)),
        _ => {
            return Err(DiffError::Decode(format!(
                "stream op must be [ref, inserts, delete_ids, reset?], got {value}"
            )));
        }
    };

    let stream_ref = match stream_ref {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(DiffError::Decode(format!(
                "stream ref must be a scalar, got {other}"
            )));
        }
    };

    let Value::Array(raw_inserts) = inserts else {
        return Err(DiffError::Decode(format!(
            "stream inserts must be an array, got {inserts}"
        )));
    };
    let inserts = raw_inserts
        .iter()
        .map(decode_stream_insert)
        .collect::<Result<Vec<_>, _>>()?;

    let Value::Array(raw_deletes) = delete_ids else {
        return Err(DiffError::Decode(format!(
            "stream delete ids must be an array, got {delete_ids}"
        )));
    };
    let delete_ids = raw_deletes
        .iter()
        .map(|v| as_string(v, "stream delete id"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StreamOp {
        stream_ref,
        inserts,
        delete_ids,
        reset,
    })
}

fn decode_stream_insert(value: &Value) -> Result<StreamInsert, DiffError> {
    let Value::Array(parts) = value else {
        return Err(DiffError::Decode(format!(
            "stream insert must be an array, got {value}"
        )));
    };
    let (id, at, limit, update_only) = match parts.as_slice() {
        [id, at] => (id, at, &Value::Null, false),
        [id, at, limit] => (id, at, limit, false),
        [id, at, limit, update] => (id, at, limit, update.as_bool().unwrap_or(false)),
        _ => {
            return Err(DiffError::Decode(format!(
                "stream insert must be [id, at, limit?, update_only?], got {value}"
            )));
        }
    };

    let limit = match limit {
        Value::Null => None,
        Value::Number(n) => Some(n.as_i64().ok_or_else(|| {
            DiffError::Decode(format!("stream limit {n} is not an integer"))
        })?),
        other => {
            return Err(DiffError::Decode(format!(
                "stream limit must be an integer or null, got {other}"
            )));
        }
    };

    Ok(StreamInsert {
        id: as_string(id, "stream insert id")?,
        at: at
            .as_i64()
            .ok_or_else(|| DiffError::Decode(format!("stream position {at} is not an integer")))?,
        limit,
        update_only,
    })
}

fn as_string(value: &Value, what: &str) -> Result<String, DiffError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(DiffError::Decode(format!(
            "{what} must be a string, got {other}"
        ))),
    }
}

fn as_usize(value: &Value, what: &str) -> Result<usize, DiffError> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DiffError::Decode(format!("{what} must be a non-negative integer")))
}

// =============================================================================
// Tests
// =============================================================================
