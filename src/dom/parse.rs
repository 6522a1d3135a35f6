//! Markup parsing into the owned tree model.
//!
//! Raw markup is parsed with `tl` and immediately converted into [`Node`]s;
//! `tl` handles never escape this module. Comments are preserved (component
//! markers may trail them) and declarations pass through as [`Node::Pi`].

use thiserror::Error;

use super::html::{is_raw_text_element, unescape};
use super::{Attrs, Element, Node};

/// Markup that could not be parsed into a fragment.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed markup: {0:?}")]
    Malformed(String),
}

/// Parse a markup string into a fragment of owned nodes.
pub fn parse_fragment(markup: &str) -> Result<Vec<Node>, ParseError> {
    let dom = tl::parse(markup, tl::ParserOptions::default())
        .map_err(|_| ParseError::Malformed(snippet(markup)))?;

    let parser = dom.parser();
    let mut nodes = Vec::new();
    for handle in dom.children() {
        if let Some(node) = convert(*handle, parser, false) {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// Convert one `tl` node handle into an owned [`Node`].
///
/// `raw_text` is set inside `<script>`/`<style>`, whose content is never
/// entity-decoded.
fn convert(handle: tl::NodeHandle, parser: &tl::Parser, raw_text: bool) -> Option<Node> {
    let node = handle.get(parser)?;

    match node {
        tl::Node::Tag(tag) => {
            let tag_name = tag.name().as_utf8_str().to_lowercase();

            let mut attrs = Attrs::new();
            for (key, value) in tag.attributes().iter() {
                let name: &str = key.as_ref();
                let value = value.map(|v| unescape(v.as_ref()).into_owned());
                attrs.set(name, value.unwrap_or_default());
            }

            let mut element = Element {
                tag: tag_name,
                attrs,
                children: Vec::new(),
            };

            let inner_raw = is_raw_text_element(&element.tag);
            for child in tag.children().top().iter() {
                if let Some(node) = convert(*child, parser, inner_raw) {
                    element.children.push(node);
                }
            }

            Some(Node::Element(Box::new(element)))
        }
        tl::Node::Raw(bytes) => {
            let text = bytes.as_utf8_str();
            if raw_text {
                Some(Node::Text(text.into_owned()))
            } else {
                Some(Node::Text(unescape(&text).into_owned()))
            }
        }
        tl::Node::Comment(bytes) => {
            let raw = bytes.as_utf8_str();
            // `tl` reports every `<!...>` construct here; split real comments
            // from declarations so the latter round-trip verbatim.
            match raw.strip_prefix("<!--") {
                Some(rest) => {
                    let body = rest.strip_suffix("-->").unwrap_or(rest);
                    Some(Node::Comment(body.to_string()))
                }
                None => Some(Node::Pi(raw.into_owned())),
            }
        }
    }
}

fn snippet(markup: &str) -> String {
    const MAX: usize = 80;
    if markup.len() <= MAX {
        markup.to_string()
    } else {
        let mut end = MAX;
        while !markup.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &markup[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::by_id;

    #[test]
    fn test_parse_nested_elements() {
        let nodes = parse_fragment(r#"<div id="a" class="x"><p>hi</p></div>"#).unwrap();
        assert_eq!(nodes.len(), 1);
        let div = nodes[0].as_element().unwrap();
        assert_eq!(div.tag, "div");
        assert_eq!(div.attrs.get("class"), Some("x"));
        let p = div.children[0].as_element().unwrap();
        assert_eq!(p.tag, "p");
        assert_eq!(p.children, vec![Node::Text("hi".into())]);
    }

    #[test]
    fn test_parse_decodes_entities() {
        let nodes = parse_fragment(r#"<p title="a &amp; b">x &lt; y</p>"#).unwrap();
        let p = nodes[0].as_element().unwrap();
        assert_eq!(p.attrs.get("title"), Some("a & b"));
        assert_eq!(p.children, vec![Node::Text("x < y".into())]);
    }

    #[test]
    fn test_parse_preserves_comments() {
        let nodes = parse_fragment("<!-- marker --><div></div>").unwrap();
        assert_eq!(nodes[0], Node::Comment(" marker ".into()));
    }

    #[test]
    fn test_parse_fragment_multi_root() {
        let nodes = parse_fragment("<p>a</p><p>b</p>").unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_parse_void_element() {
        let nodes = parse_fragment(r#"<div id="a"><input name="q"><br></div>"#).unwrap();
        let div = by_id(&nodes, "a").unwrap();
        assert_eq!(div.children.len(), 2);
        assert_eq!(div.children[0].as_element().unwrap().tag, "input");
    }

    #[test]
    fn test_parse_boolean_attribute() {
        let nodes = parse_fragment(r#"<input type="checkbox" checked>"#).unwrap();
        let input = nodes[0].as_element().unwrap();
        assert!(input.attrs.has("checked"));
        assert_eq!(input.attrs.get("checked"), Some(""));
    }

    #[test]
    fn test_parse_script_keeps_raw_content() {
        let nodes = parse_fragment("<script>if (a &amp;&amp; b) {}</script>").unwrap();
        let script = nodes[0].as_element().unwrap();
        // Raw-text content is not entity-decoded.
        assert_eq!(
            script.children,
            vec![Node::Text("if (a &amp;&amp; b) {}".into())]
        );
    }
}
