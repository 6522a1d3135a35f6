//! Tree renderer: expands accumulated rendered state into markup.
//!
//! Statics and dynamics interleave into one markup string, which is then
//! parsed back into a tree-model fragment — statics are raw markup and
//! dynamics may produce markup, so the string round-trip is the contract,
//! not a shortcut. Component slots render through the shared table and get
//! the identity marker injected into their first root tag.

use rustc_hash::FxHashMap;

use super::{Body, DiffError, Rendered, RenderedTree, Slot};
use crate::dom::{COMPONENT_ATTR, Node, parse::parse_fragment};

/// Render the accumulated tree to a markup string.
pub fn to_markup(tree: &RenderedTree) -> Result<String, DiffError> {
    let mut out = String::new();
    write_rendered(&tree.root, &tree.components, &mut out)?;
    Ok(out)
}

/// Render the accumulated tree to a tree-model fragment.
pub fn to_fragment(tree: &RenderedTree) -> Result<Vec<Node>, DiffError> {
    let markup = to_markup(tree)?;
    Ok(parse_fragment(&markup)?)
}

/// Render a single component from the table (markers included).
pub fn component_to_markup(
    cid: i64,
    components: &FxHashMap<i64, Rendered>,
) -> Result<String, DiffError> {
    let rendered = components.get(&cid).ok_or(DiffError::MissingComponent(cid))?;
    let mut out = String::new();
    write_rendered(rendered, components, &mut out)?;
    Ok(inject_component_marker(&out, cid))
}

fn write_rendered(
    rendered: &Rendered,
    components: &FxHashMap<i64, Rendered>,
    out: &mut String,
) -> Result<(), DiffError> {
    let statics = &rendered.statics;
    match &rendered.body {
        Body::Slots(slots) => write_interleaved(statics, slots, components, out),
        Body::Items(items) => {
            for item in items {
                write_interleaved(statics, item, components, out)?;
            }
            Ok(())
        }
    }
}

fn write_interleaved(
    statics: &[String],
    slots: &[Slot],
    components: &FxHashMap<i64, Rendered>,
    out: &mut String,
) -> Result<(), DiffError> {
    if slots.len() + 1 != statics.len() {
        return Err(DiffError::Arity {
            len: slots.len(),
            statics: statics.len(),
        });
    }
    out.push_str(&statics[0]);
    for (i, slot) in slots.iter().enumerate() {
        match slot {
            Slot::Literal(text) => out.push_str(text),
            Slot::Nested(rendered) => write_rendered(rendered, components, out)?,
            Slot::Component(cid) => out.push_str(&component_to_markup(*cid, components)?),
        }
        out.push_str(&statics[i + 1]);
    }
    Ok(())
}

/// Insert the component-identity marker into the first start tag of a
/// rendered component, skipping leading whitespace and comments.
///
/// A component that renders no element (text only) is returned untouched;
/// there is nothing to anchor identity to.
fn inject_component_marker(markup: &str, cid: i64) -> String {
    let bytes = markup.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if markup[i..].starts_with("<!--") {
            match markup[i + 4..].find("-->") {
                Some(end) => {
                    i += 4 + end + 3;
                    continue;
                }
                None => break,
            }
        }
        if bytes[i] == b'<' && bytes.get(i + 1).is_some_and(u8::is_ascii_alphabetic) {
            let mut j = i + 1;
            while j < bytes.len() && !matches!(bytes[j], b'>' | b'/') && !bytes[j].is_ascii_whitespace()
            {
                j += 1;
            }
            let mut out = String::with_capacity(markup.len() + COMPONENT_ATTR.len() + 8);
            out.push_str(&markup[..j]);
            out.push_str(&format!(" {COMPONENT_ATTR}=\"{cid}\""));
            out.push_str(&markup[j..]);
            return out;
        }
        break;
    }
    markup.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{RootDiff, merge::merge};
    use serde_json::json;

    fn tree_from(value: serde_json::Value) -> RenderedTree {
        let mut tree = RenderedTree::default();
        merge(&mut tree, RootDiff::decode(&value).unwrap()).unwrap();
        tree
    }

    #[test]
    fn test_render_flat_round_trip() {
        let mut tree = tree_from(json!({ "s": ["<p>", "</p>"], "0": "hi" }));
        assert_eq!(to_markup(&tree).unwrap(), "<p>hi</p>");

        merge(&mut tree, RootDiff::decode(&json!({ "0": "bye" })).unwrap()).unwrap();
        assert_eq!(to_markup(&tree).unwrap(), "<p>bye</p>");
    }

    #[test]
    fn test_render_comprehension() {
        let tree = tree_from(json!({
            "s": ["<ul>", "</ul>"],
            "0": { "s": ["<li>", "</li>"], "d": [["a"], ["b"]] },
        }));
        assert_eq!(to_markup(&tree).unwrap(), "<ul><li>a</li><li>b</li></ul>");
    }

    #[test]
    fn test_render_component_with_marker() {
        let tree = tree_from(json!({
            "s": ["<div>", "</div>"],
            "0": 1,
            "c": { "1": { "s": ["<b class=\"x\">", "</b>"], "0": "hey" } },
        }));
        assert_eq!(
            to_markup(&tree).unwrap(),
            format!(r#"<div><b {COMPONENT_ATTR}="1" class="x">hey</b></div>"#)
        );
    }

    #[test]
    fn test_marker_skips_leading_comment() {
        let tree = tree_from(json!({
            "s": ["", ""],
            "0": 1,
            "c": { "1": { "s": ["<!-- c --><span>", "</span>"], "0": "x" } },
        }));
        assert_eq!(
            to_markup(&tree).unwrap(),
            format!(r#"<!-- c --><span {COMPONENT_ATTR}="1">x</span>"#)
        );
    }

    #[test]
    fn test_missing_component_is_an_error() {
        let tree = tree_from(json!({ "s": ["<div>", "</div>"], "0": "x" }));
        let err = component_to_markup(9, &tree.components).unwrap_err();
        assert!(matches!(err, DiffError::MissingComponent(9)));
    }

    #[test]
    fn test_to_fragment_parses_markup() {
        let tree = tree_from(json!({ "s": ["<div id=\"x\">", "</div>"], "0": "0" }));
        let nodes = to_fragment(&tree).unwrap();
        let div = crate::dom::by_id(&nodes, "x").unwrap();
        assert_eq!(crate::dom::select::text_content(div), "0");
    }

    #[test]
    fn test_arity_mismatch_is_an_error() {
        let tree = RenderedTree {
            root: Rendered {
                statics: vec!["<p>".into(), "-".into(), "</p>".into()],
                body: Body::Slots(vec![Slot::Literal("only".into())]),
            },
            ..Default::default()
        };
        assert!(matches!(
            to_markup(&tree).unwrap_err(),
            DiffError::Arity { .. }
        ));
    }
}
