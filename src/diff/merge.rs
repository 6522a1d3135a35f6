//! Diff merge engine.
//!
//! Merges a sparse wire diff into the accumulated [`RenderedTree`]:
//!
//! 1. extract stream ops (depth-first) out of the diff copy,
//! 2. resolve template back-references into inline statics,
//! 3. deep-merge the structural diff (fresh statics replace a node
//!    wholesale, keyed blocks reorder against old items, maps merge
//!    key-wise, scalars overwrite),
//! 4. resolve changed components against old and new tables, memoized so
//!    shared static references resolve once per merge cycle,
//! 5. attach the extracted stream list, replacing the previous one.
//!
//! Untouched components carry forward; eviction only ever happens through
//! the patcher's destroyed-cid handshake.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    Body, DiffError, DiffNode, ItemDiff, KeyedDiff, KeyedOp, Rendered, RenderedTree, RootDiff,
    Slot, SlotDiff, StaticsRef, StreamOp,
};

/// Merge one decoded diff into the accumulated tree.
pub fn merge(tree: &mut RenderedTree, diff: RootDiff) -> Result<(), DiffError> {
    let RootDiff {
        mut node,
        mut components,
        title: _,
    } = diff;

    let mut streams = Vec::new();
    extract_streams(&mut node, &mut streams);
    for component in components.values_mut() {
        extract_streams(component, &mut streams);
    }

    resolve_templates(&mut node, None)?;
    for component in components.values_mut() {
        resolve_templates(component, None)?;
    }

    merge_node(&mut tree.root, node)?;
    if !components.is_empty() {
        merge_components(&mut tree.components, components)?;
    }

    tree.streams = streams;
    Ok(())
}

// =============================================================================
// Stream Extraction
// =============================================================================

/// Pull every stream op out of the diff, depth-first, clearing the markers.
///
/// Streams do not participate in the structural merge; they are applied by
/// the patcher against the live tree.
fn extract_streams(node: &mut DiffNode, out: &mut Vec<StreamOp>) {
    if let Some(op) = node.stream.take() {
        out.push(op);
    }
    for slot in node.slots.values_mut() {
        extract_slot_streams(slot, out);
    }
    if let Some(entries) = &mut node.entries {
        for item in entries {
            for slot in item {
                extract_slot_streams(slot, out);
            }
        }
    }
    if let Some(keyed) = &mut node.keyed {
        for op in keyed.entries.values_mut() {
            if let KeyedOp::Patch(item) | KeyedOp::MovePatch(_, item) = op {
                for slot in item.values_mut() {
                    extract_slot_streams(slot, out);
                }
            }
        }
    }
}

fn extract_slot_streams(slot: &mut SlotDiff, out: &mut Vec<StreamOp>) {
    if let SlotDiff::Node(node) = slot {
        extract_streams(node, out);
    }
}

// =============================================================================
// Template Resolution
// =============================================================================

type Templates = FxHashMap<usize, Vec<String>>;

/// Inline template statics before the structural merge.
///
/// A node's own table applies to its descendants (and shadows any outer
/// table); the node's own statics resolve against the outer scope. This
/// must run before merging because a later patch may carry a different,
/// incompatible table.
fn resolve_templates(node: &mut DiffNode, inherited: Option<&Templates>) -> Result<(), DiffError> {
    if let Some(StaticsRef::Ref(index)) = node.statics
        && index >= 0
        && let Some(table) = inherited
    {
        let index = index as usize;
        match table.get(&index) {
            Some(fragments) => node.statics = Some(StaticsRef::Fragments(fragments.clone())),
            None => return Err(DiffError::UnknownTemplate(index)),
        }
    }

    let own = node.templates.take();
    let scope = own.as_ref().or(inherited);

    for slot in node.slots.values_mut() {
        resolve_slot_templates(slot, scope)?;
    }
    if let Some(entries) = &mut node.entries {
        for item in entries {
            for slot in item {
                resolve_slot_templates(slot, scope)?;
            }
        }
    }
    if let Some(keyed) = &mut node.keyed {
        for op in keyed.entries.values_mut() {
            if let KeyedOp::Patch(item) | KeyedOp::MovePatch(_, item) = op {
                for slot in item.values_mut() {
                    resolve_slot_templates(slot, scope)?;
                }
            }
        }
    }
    Ok(())
}

fn resolve_slot_templates(slot: &mut SlotDiff, scope: Option<&Templates>) -> Result<(), DiffError> {
    match slot {
        SlotDiff::Node(node) => resolve_templates(node, scope),
        _ => Ok(()),
    }
}

// =============================================================================
// Structural Merge
// =============================================================================

fn expect_fragments(statics: StaticsRef) -> Result<Vec<String>, DiffError> {
    match statics {
        StaticsRef::Fragments(fragments) => Ok(fragments),
        StaticsRef::Ref(_) => Err(DiffError::UnresolvedStatics),
    }
}

/// Deep-merge one diff node into an accumulated container.
fn merge_node(old: &mut Rendered, mut diff: DiffNode) -> Result<(), DiffError> {
    debug_assert!(diff.templates.is_none(), "templates resolve before merge");
    debug_assert!(diff.stream.is_none(), "streams extract before merge");

    // Keyed blocks come first: old items must stay addressable for moves
    // even when the shared statics are refreshed in the same diff.
    if let Some(keyed) = diff.keyed.take() {
        if let Some(statics) = diff.statics.take() {
            old.statics = expect_fragments(statics)?;
        }
        return merge_keyed(old, keyed);
    }

    // Fresh statics replace the node wholesale: once statics change, the
    // old dynamics are not a reliable merge target.
    if diff.statics.is_some() {
        *old = resolve_node(diff)?;
        return Ok(());
    }

    // Comprehension entries are full renders, not diffs; the new list is
    // authoritative.
    if let Some(entries) = diff.entries.take() {
        let items = entries
            .into_iter()
            .map(resolve_item)
            .collect::<Result<Vec<_>, _>>()?;
        old.body = Body::Items(items);
        return Ok(());
    }

    if diff.slots.is_empty() {
        return Ok(());
    }

    let Body::Slots(slots) = &mut old.body else {
        return Err(DiffError::Shape("sparse slot update against an item body"));
    };
    let len = slots.len();
    for (index, slot_diff) in diff.slots {
        let slot = slots
            .get_mut(index)
            .ok_or(DiffError::SlotOutOfRange { index, len })?;
        merge_slot(slot, slot_diff)?;
    }
    Ok(())
}

fn merge_slot(old: &mut Slot, diff: SlotDiff) -> Result<(), DiffError> {
    match diff {
        SlotDiff::Literal(text) => *old = Slot::Literal(text),
        SlotDiff::Component(cid) => *old = Slot::Component(cid),
        SlotDiff::Node(node) => match old {
            Slot::Nested(rendered) => merge_node(rendered, node)?,
            _ => *old = Slot::Nested(Box::new(resolve_node(node)?)),
        },
    }
    Ok(())
}

fn merge_keyed(old: &mut Rendered, keyed: KeyedDiff) -> Result<(), DiffError> {
    let old_items = match std::mem::replace(&mut old.body, Body::Slots(Vec::new())) {
        Body::Items(items) => items,
        // First keyed diff against a freshly-created node.
        Body::Slots(slots) if slots.is_empty() => Vec::new(),
        Body::Slots(_) => return Err(DiffError::Shape("keyed diff against a slot body")),
    };
    let old_len = old_items.len();

    let KeyedDiff { count, mut entries } = keyed;
    let mut items = Vec::with_capacity(count);
    for position in 0..count {
        let item = match entries.remove(&position) {
            None | Some(KeyedOp::Keep) => {
                old_items
                    .get(position)
                    .cloned()
                    .ok_or(DiffError::KeyedOutOfRange {
                        index: position,
                        len: old_len,
                    })?
            }
            Some(KeyedOp::Move(from)) => {
                old_items
                    .get(from)
                    .cloned()
                    .ok_or(DiffError::KeyedOutOfRange {
                        index: from,
                        len: old_len,
                    })?
            }
            Some(KeyedOp::Patch(item_diff)) => match old_items.get(position) {
                Some(existing) => merge_item(existing.clone(), item_diff)?,
                None => resolve_item_map(item_diff)?,
            },
            Some(KeyedOp::MovePatch(from, item_diff)) => {
                let existing =
                    old_items
                        .get(from)
                        .cloned()
                        .ok_or(DiffError::KeyedOutOfRange {
                            index: from,
                            len: old_len,
                        })?;
                merge_item(existing, item_diff)?
            }
        };
        items.push(item);
    }
    // Positions at or beyond `count` are dropped: the block size is
    // authoritative.
    old.body = Body::Items(items);
    Ok(())
}

fn merge_item(mut item: Vec<Slot>, diff: ItemDiff) -> Result<Vec<Slot>, DiffError> {
    let len = item.len();
    for (index, slot_diff) in diff {
        let slot = item
            .get_mut(index)
            .ok_or(DiffError::SlotOutOfRange { index, len })?;
        merge_slot(slot, slot_diff)?;
    }
    Ok(item)
}

// =============================================================================
// Fresh-Node Resolution
// =============================================================================

/// Build a dense [`Rendered`] from a statics-bearing diff node.
fn resolve_node(mut diff: DiffNode) -> Result<Rendered, DiffError> {
    let statics = expect_fragments(
        diff.statics
            .take()
            .ok_or(DiffError::Shape("new node without statics"))?,
    )?;

    let body = if let Some(entries) = diff.entries.take() {
        Body::Items(
            entries
                .into_iter()
                .map(resolve_item)
                .collect::<Result<Vec<_>, _>>()?,
        )
    } else if let Some(keyed) = diff.keyed.take() {
        let KeyedDiff { count, mut entries } = keyed;
        let mut items = Vec::with_capacity(count);
        for position in 0..count {
            match entries.remove(&position) {
                Some(KeyedOp::Patch(item)) => items.push(resolve_item_map(item)?),
                Some(_) => {
                    return Err(DiffError::Shape("keyed op references old state in a fresh node"));
                }
                None => return Err(DiffError::IncompleteNode { index: position }),
            }
        }
        Body::Items(items)
    } else {
        let mut slots = Vec::with_capacity(statics.len().saturating_sub(1));
        for index in 0..statics.len() - 1 {
            let slot = diff
                .slots
                .remove(&index)
                .ok_or(DiffError::IncompleteNode { index })?;
            slots.push(resolve_slot(slot)?);
        }
        Body::Slots(slots)
    };

    Ok(Rendered { statics, body })
}

fn resolve_slot(diff: SlotDiff) -> Result<Slot, DiffError> {
    match diff {
        SlotDiff::Literal(text) => Ok(Slot::Literal(text)),
        SlotDiff::Component(cid) => Ok(Slot::Component(cid)),
        SlotDiff::Node(node) => Ok(Slot::Nested(Box::new(resolve_node(node)?))),
    }
}

fn resolve_item(entry: Vec<SlotDiff>) -> Result<Vec<Slot>, DiffError> {
    entry.into_iter().map(resolve_slot).collect()
}

fn resolve_item_map(mut item: ItemDiff) -> Result<Vec<Slot>, DiffError> {
    let len = item.len();
    let mut slots = Vec::with_capacity(len);
    for index in 0..len {
        let slot = item
            .remove(&index)
            .ok_or(DiffError::IncompleteNode { index })?;
        slots.push(resolve_slot(slot)?);
    }
    Ok(slots)
}

// =============================================================================
// Component Resolution
// =============================================================================

/// Memoized resolver for one merge cycle's component diffs.
///
/// Memoization keeps shared static references linear: each component id
/// resolves exactly once per cycle no matter how often it is referenced.
struct ComponentResolver<'a> {
    diffs: &'a FxHashMap<i64, DiffNode>,
    old: &'a FxHashMap<i64, Rendered>,
    resolved: FxHashMap<i64, Rendered>,
    in_flight: FxHashSet<i64>,
    resolutions: usize,
}

impl<'a> ComponentResolver<'a> {
    fn new(diffs: &'a FxHashMap<i64, DiffNode>, old: &'a FxHashMap<i64, Rendered>) -> Self {
        Self {
            diffs,
            old,
            resolved: FxHashMap::default(),
            in_flight: FxHashSet::default(),
            resolutions: 0,
        }
    }

    fn resolve(&mut self, cid: i64) -> Result<Rendered, DiffError> {
        if let Some(done) = self.resolved.get(&cid) {
            return Ok(done.clone());
        }
        if !self.in_flight.insert(cid) {
            return Err(DiffError::CyclicShare(cid));
        }
        self.resolutions += 1;

        let mut diff = self
            .diffs
            .get(&cid)
            .cloned()
            .ok_or(DiffError::MissingComponent(cid))?;

        let mut base = match diff.statics {
            // Positive share: build on another new component, resolved first.
            Some(StaticsRef::Ref(share)) if share > 0 => {
                diff.statics = None;
                self.resolve(share)?
            }
            // Negative share: build on the pre-merge state of another component.
            Some(StaticsRef::Ref(share)) if share < 0 => {
                diff.statics = None;
                self.old
                    .get(&-share)
                    .cloned()
                    .ok_or(DiffError::MissingOldComponent(cid, -share))?
            }
            _ => self.old.get(&cid).cloned().unwrap_or_default(),
        };

        merge_node(&mut base, diff)?;
        self.in_flight.remove(&cid);
        self.resolved.insert(cid, base.clone());
        Ok(base)
    }
}

fn merge_components(
    table: &mut FxHashMap<i64, Rendered>,
    diffs: FxHashMap<i64, DiffNode>,
) -> Result<(), DiffError> {
    let old = table.clone();
    let mut resolver = ComponentResolver::new(&diffs, &old);

    let mut cids: Vec<i64> = diffs.keys().copied().collect();
    cids.sort_unstable();
    for cid in cids {
        resolver.resolve(cid)?;
    }

    for (cid, rendered) in resolver.resolved {
        table.insert(cid, rendered);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree_from(value: serde_json::Value) -> RenderedTree {
        let mut tree = RenderedTree::default();
        merge(&mut tree, RootDiff::decode(&value).unwrap()).unwrap();
        tree
    }

    fn apply(tree: &mut RenderedTree, value: serde_json::Value) {
        merge(tree, RootDiff::decode(&value).unwrap()).unwrap();
    }

    fn literal(s: &str) -> Slot {
        Slot::Literal(s.to_string())
    }

    #[test]
    fn test_merge_flat_dynamics() {
        let mut tree = tree_from(json!({ "s": ["<p>", "</p>"], "0": "hi" }));
        assert_eq!(tree.root.body, Body::Slots(vec![literal("hi")]));

        apply(&mut tree, json!({ "0": "bye" }));
        assert_eq!(tree.root.body, Body::Slots(vec![literal("bye")]));
        assert_eq!(tree.root.statics, vec!["<p>", "</p>"]);
    }

    #[test]
    fn test_merge_empty_diff_is_noop() {
        let mut tree = tree_from(json!({ "s": ["<p>", "</p>"], "0": "hi" }));
        let before = tree.clone();
        let diff = RootDiff::decode(&json!({})).unwrap();
        assert!(diff.is_empty());
        merge(&mut tree, diff).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn test_fresh_statics_replace_node() {
        let mut tree = tree_from(json!({
            "s": ["<div>", "</div>"],
            "0": { "s": ["<a>", "</a>"], "0": "x" },
        }));
        apply(&mut tree, json!({ "0": { "s": ["<b>", "</b>"], "0": "y" } }));
        let Body::Slots(slots) = &tree.root.body else {
            panic!("expected slots")
        };
        let Slot::Nested(inner) = &slots[0] else {
            panic!("expected nested")
        };
        assert_eq!(inner.statics, vec!["<b>", "</b>"]);
        assert_eq!(inner.body, Body::Slots(vec![literal("y")]));
    }

    #[test]
    fn test_incomplete_fresh_node_is_an_error() {
        let mut tree = RenderedTree::default();
        let diff = RootDiff::decode(&json!({ "s": ["<p>", "-", "</p>"], "0": "x" })).unwrap();
        let err = merge(&mut tree, diff).unwrap_err();
        assert!(matches!(err, DiffError::IncompleteNode { index: 1 }));
    }

    #[test]
    fn test_slot_out_of_range() {
        let mut tree = tree_from(json!({ "s": ["<p>", "</p>"], "0": "hi" }));
        let diff = RootDiff::decode(&json!({ "3": "nope" })).unwrap();
        let err = merge(&mut tree, diff).unwrap_err();
        assert!(matches!(err, DiffError::SlotOutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn test_comprehension_entries_replace_wholesale() {
        let mut tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": { "s": ["<li>", "</li>"], "d": [["a"], ["b"]] },
        }));
        apply(&mut tree, json!({ "0": { "d": [["c"]] } }));
        let Body::Slots(slots) = &tree.root.body else {
            panic!("expected slots")
        };
        let Slot::Nested(inner) = &slots[0] else {
            panic!("expected nested")
        };
        assert_eq!(inner.body, Body::Items(vec![vec![literal("c")]]));
    }

    #[test]
    fn test_keyed_reorder_drop_and_patch() {
        // Accumulated keyed block with items A, B, C.
        let mut tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": {
                "s": ["<li>", "</li>"],
                "k": { "0": {"0": "A"}, "1": {"0": "B"}, "2": {"0": "C"}, "kc": 3 },
            },
        }));

        // Position 0 takes old item 1, position 1 takes old item 2 patched;
        // old position 2 falls off the end.
        apply(
            &mut tree,
            json!({ "0": { "k": { "0": 1, "1": [2, {"0": "C2"}], "kc": 2 } } }),
        );

        let Body::Slots(slots) = &tree.root.body else {
            panic!("expected slots")
        };
        let Slot::Nested(inner) = &slots[0] else {
            panic!("expected nested")
        };
        assert_eq!(
            inner.body,
            Body::Items(vec![vec![literal("B")], vec![literal("C2")]])
        );
    }

    #[test]
    fn test_keyed_keep_defaults_to_same_position() {
        let mut tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": {
                "s": ["<li>", "</li>"],
                "k": { "0": {"0": "A"}, "1": {"0": "B"}, "kc": 2 },
            },
        }));
        // Explicit null for 0, absent for 1: both keep.
        apply(&mut tree, json!({ "0": { "k": { "0": null, "kc": 2 } } }));
        let Body::Slots(slots) = &tree.root.body else {
            panic!("expected slots")
        };
        let Slot::Nested(inner) = &slots[0] else {
            panic!("expected nested")
        };
        assert_eq!(
            inner.body,
            Body::Items(vec![vec![literal("A")], vec![literal("B")]])
        );
    }

    #[test]
    fn test_template_resolution() {
        let tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": {
                "s": ["<div>", "</div>"],
                "d": [[{ "s": 0, "0": "a" }], [{ "s": 0, "0": "b" }]],
                "p": { "0": ["<li>", "</li>"] },
            },
        }));
        let Body::Slots(slots) = &tree.root.body else {
            panic!("expected slots")
        };
        let Slot::Nested(inner) = &slots[0] else {
            panic!("expected nested")
        };
        let Body::Items(items) = &inner.body else {
            panic!("expected items")
        };
        let Slot::Nested(first) = &items[0][0] else {
            panic!("expected nested item")
        };
        assert_eq!(first.statics, vec!["<li>", "</li>"]);
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        let mut tree = RenderedTree::default();
        let diff = RootDiff::decode(&json!({
            "s": ["<ul>", "</ul>"],
            "0": {
                "s": ["<div>", "</div>"],
                "d": [[{ "s": 7, "0": "a" }]],
                "p": { "0": ["<li>", "</li>"] },
            },
        }))
        .unwrap();
        let err = merge(&mut tree, diff).unwrap_err();
        assert!(matches!(err, DiffError::UnknownTemplate(7)));
    }

    #[test]
    fn test_streams_are_extracted_and_transient() {
        let mut tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": {
                "s": ["<li>", "</li>"],
                "d": [["x"]],
                "stream": ["songs", [["songs-1", -1, null, false]], []],
            },
        }));
        assert_eq!(tree.streams.len(), 1);
        assert_eq!(tree.streams[0].stream_ref, "songs");

        // The next merge replaces the stream list, even with an empty one.
        apply(&mut tree, json!({ "0": { "d": [["y"]] } }));
        assert!(tree.streams.is_empty());
    }

    #[test]
    fn test_component_share_chain_and_memoization() {
        // Old component 2 exists; new diff: 1 shares new 2's statics, 2
        // shares old 2's statics.
        let mut tree = tree_from(json!({
            "s": ["<div>", "</div>"],
            "0": 2,
            "c": { "2": { "s": ["<b>", "</b>"], "0": "old" } },
        }));

        let diff = RootDiff::decode(&json!({
            "0": 1,
            "c": {
                "1": { "s": 2, "0": "one" },
                "2": { "s": -2, "0": "two" },
            },
        }))
        .unwrap();

        let old = tree.components.clone();
        let mut resolver = ComponentResolver::new(&diff.components, &old);
        let mut cids: Vec<i64> = diff.components.keys().copied().collect();
        cids.sort_unstable();
        for cid in cids {
            resolver.resolve(cid).unwrap();
        }
        // 1 pulls 2 in early, the loop then hits the memo: two resolutions
        // for two components, not three.
        assert_eq!(resolver.resolutions, 2);

        merge(&mut tree, diff).unwrap();
        let one = &tree.components[&1];
        let two = &tree.components[&2];
        assert_eq!(one.statics, vec!["<b>", "</b>"]);
        assert_eq!(one.body, Body::Slots(vec![literal("one")]));
        assert_eq!(two.statics, vec!["<b>", "</b>"]);
        assert_eq!(two.body, Body::Slots(vec![literal("two")]));
    }

    #[test]
    fn test_untouched_components_carry_forward() {
        let mut tree = tree_from(json!({
            "s": ["<div>", "-", "</div>"],
            "0": 1,
            "1": 2,
            "c": {
                "1": { "s": ["<i>", "</i>"], "0": "a" },
                "2": { "s": ["<u>", "</u>"], "0": "b" },
            },
        }));
        apply(&mut tree, json!({ "c": { "1": { "0": "a2" } } }));
        assert_eq!(tree.components[&1].body, Body::Slots(vec![literal("a2")]));
        // Component 2 untouched this cycle.
        assert_eq!(tree.components[&2].body, Body::Slots(vec![literal("b")]));
    }

    #[test]
    fn test_cyclic_share_is_an_error() {
        let mut tree = RenderedTree::default();
        let diff = RootDiff::decode(&json!({
            "c": {
                "1": { "s": 2 },
                "2": { "s": 1 },
            },
        }))
        .unwrap();
        let err = merge(&mut tree, diff).unwrap_err();
        assert!(matches!(err, DiffError::CyclicShare(_)));
    }

    #[test]
    fn test_missing_old_share_is_an_error() {
        let mut tree = RenderedTree::default();
        let diff = RootDiff::decode(&json!({
            "c": { "1": { "s": -9, "0": "x" } },
        }))
        .unwrap();
        let err = merge(&mut tree, diff).unwrap_err();
        assert!(matches!(err, DiffError::MissingOldComponent(1, 9)));
    }
}
