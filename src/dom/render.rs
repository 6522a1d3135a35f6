//! Serialization of the tree model back to markup.

use super::html::{escape_attr, escape_text, is_raw_text_element, is_void_element};
use super::{Element, Node};

/// Serialize a fragment to markup.
pub fn to_markup(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(node, &mut out);
    }
    out
}

/// Serialize a single node to markup.
pub fn node_to_markup(node: &Node) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

/// Serialize only the children of an element (its inner markup).
pub fn inner_markup(element: &Element) -> String {
    to_markup(&element.children)
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Element(el) => write_element(el, out),
        Node::Text(text) => out.push_str(&escape_text(text)),
        Node::Comment(body) => {
            out.push_str("<!--");
            out.push_str(body);
            out.push_str("-->");
        }
        Node::Pi(raw) => out.push_str(raw),
    }
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.tag);
    for (name, value) in el.attrs.iter() {
        out.push(' ');
        out.push_str(name);
        if !value.is_empty() {
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
    }
    out.push('>');

    if is_void_element(&el.tag) {
        return;
    }

    if is_raw_text_element(&el.tag) {
        for child in &el.children {
            if let Node::Text(text) = child {
                out.push_str(text);
            }
        }
    } else {
        for child in &el.children {
            write_node(child, out);
        }
    }

    out.push_str("</");
    out.push_str(&el.tag);
    out.push('>');
}
