//! Keyed stream reconciliation.
//!
//! Applies extracted stream ops to one `stream`-strategy container:
//!
//! 1. resets purge every existing child tagged with that stream's ref,
//! 2. delete ids remove matching children, in stream order,
//! 3. the new inner content is walked in order — declared inserts land at
//!    their position in the already-filtered list (later inserts see
//!    earlier ones), existing ids update in place without reordering,
//!    `update_only` inserts never materialize absent ids, undeclared
//!    content appends at the end,
//! 4. each insert's signed limit truncates from the indicated end.

use rustc_hash::FxHashMap;

use super::{PatchError, Strategy, required_id};
use crate::diff::{StreamInsert, StreamOp};
use crate::dom::{Element, Node, STREAM_ATTR, by_id};

pub(super) fn apply(
    mut el: Box<Element>,
    document: &[Node],
    streams: &[StreamOp],
) -> Result<Node, PatchError> {
    let container_id = required_id(&el, Strategy::Stream)?;

    // Validate before touching anything: every stream child needs an id.
    for child in &el.children {
        if let Some(child_el) = child.as_element()
            && child_el.id().is_none()
        {
            return Err(PatchError::StreamChildWithoutId {
                container: container_id,
            });
        }
    }

    let mut children: Vec<Node> = by_id(document, &container_id)
        .map(|old| old.children.clone())
        .unwrap_or_default();

    // a. Full-stream replace: purge children inserted by resetting streams.
    for op in streams.iter().filter(|op| op.reset) {
        children.retain(|node| {
            node.as_element()
                .is_none_or(|el| el.attr(STREAM_ATTR) != Some(op.stream_ref.as_str()))
        });
    }

    // b. Deletions, in stream order.
    for op in streams {
        for delete_id in &op.delete_ids {
            children.retain(|node| {
                node.as_element()
                    .is_none_or(|el| el.id() != Some(delete_id.as_str()))
            });
        }
    }

    // Declared inserts by child id; a later stream's declaration wins.
    let mut declared: FxHashMap<&str, (&str, &StreamInsert)> = FxHashMap::default();
    for op in streams {
        for insert in &op.inserts {
            declared.insert(insert.id.as_str(), (op.stream_ref.as_str(), insert));
        }
    }

    // c. Walk the new content in order against the evolving child list.
    for child in el.children.drain(..) {
        let Node::Element(mut child_el) = child else {
            // Inter-element whitespace and comments carry no identity.
            continue;
        };
        let child_id = child_el
            .id()
            .expect("stream children validated above")
            .to_string();
        let position = children.iter().position(|node| {
            node.as_element()
                .is_some_and(|el| el.id() == Some(child_id.as_str()))
        });

        match declared.get(child_id.as_str()) {
            None => match position {
                // Ordinary non-stream update to a tracked element.
                Some(i) => children[i] = Node::Element(child_el),
                // Content outside the stream protocol joins at the end.
                None => children.push(Node::Element(child_el)),
            },
            Some((stream_ref, insert)) => {
                child_el.attrs.set(STREAM_ATTR, *stream_ref);
                match position {
                    // Value update without reordering.
                    Some(i) => children[i] = Node::Element(child_el),
                    None if insert.update_only => {}
                    None => {
                        let index = if insert.at < 0 {
                            children.len()
                        } else {
                            (insert.at as usize).min(children.len())
                        };
                        children.insert(index, Node::Element(child_el));
                        if let Some(limit) = insert.limit {
                            truncate(&mut children, limit);
                        }
                    }
                }
            }
        }
    }

    el.children = children;
    Ok(Node::Element(el))
}

/// Signed truncation: positive keeps the first N children, negative the
/// last |N|.
fn truncate(children: &mut Vec<Node>, limit: i64) {
    if limit >= 0 {
        children.truncate(limit as usize);
    } else {
        let keep = limit.unsigned_abs() as usize;
        if children.len() > keep {
            children.drain(..children.len() - keep);
        }
    }
}
