//! Synthetic interaction preparation.
//!
//! Derives the protocol event name and payload from a target element's
//! attributes: `wr-*` bindings select the server event, `wr-value-*`
//! attributes feed click-like payloads, and form-like events serialize the
//! enclosing form with HTML form-submission defaulting rules.

use serde_json::{Map, Value, json};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use super::ClientError;
use crate::dom::select::text_content;
use crate::dom::{Element, LINK_ATTR, Node, VALUE_PREFIX};

/// Percent-encoding set for form pairs: RFC 3986 unreserved stays literal.
const FORM_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// =============================================================================
// Events
// =============================================================================

/// Synthetic event kinds a caller can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    Click,
    Submit,
    Change,
    Keyup,
    Keydown,
    Blur,
    Focus,
    Hook,
}

impl ViewEvent {
    /// The binding attribute naming the server event.
    pub(crate) const fn binding(self) -> &'static str {
        match self {
            Self::Click => "wr-click",
            Self::Submit => "wr-submit",
            Self::Change => "wr-change",
            Self::Keyup => "wr-keyup",
            Self::Keydown => "wr-keydown",
            Self::Blur => "wr-blur",
            Self::Focus => "wr-focus",
            Self::Hook => "wr-hook",
        }
    }

    /// The `type` field of the pushed payload.
    pub(crate) const fn payload_type(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Submit | Self::Change => "form",
            Self::Keyup => "keyup",
            Self::Keydown => "keydown",
            Self::Blur => "blur",
            Self::Focus => "focus",
            Self::Hook => "hook",
        }
    }

    const fn is_form_like(self) -> bool {
        matches!(self, Self::Submit | Self::Change)
    }
}

/// What firing an event at the target amounts to.
#[derive(Debug, PartialEq)]
pub(crate) enum Interaction {
    /// Push an `event` message and await the correlated reply.
    Push { event: String, payload: Value },
    /// Push a `live_patch` navigation (anchor fallback).
    LivePatch { href: String },
    /// Leave the page entirely (anchor fallback); fails the caller.
    Redirect { to: String },
}

/// Derive the interaction for `kind` fired at `target`.
///
/// `value` carries caller-supplied extras: merged into click-like payload
/// maps, or overriding serialized form pairs for form-like events.
pub(crate) fn prepare(
    kind: ViewEvent,
    document: &[Node],
    target: &Element,
    value: &Value,
) -> Result<Interaction, ClientError> {
    let binding = kind.binding();
    let Some(event) = target.attr(binding).filter(|v| !v.is_empty()) else {
        // Unbound anchors fall back to navigation semantics.
        if kind == ViewEvent::Click && target.tag == "a" {
            return anchor_navigation(target);
        }
        return Err(ClientError::NoEventBinding {
            binding: binding.to_string(),
            tag: target.tag.clone(),
        });
    };

    let payload = if kind.is_form_like() {
        let form = if target.tag == "form" {
            target
        } else {
            enclosing_form(document, target).unwrap_or(target)
        };
        let mut pairs = form_values(form);
        apply_overrides(&mut pairs, value);
        json!({
            "type": kind.payload_type(),
            "event": event,
            "value": encode_pairs(&pairs),
        })
    } else {
        json!({
            "type": kind.payload_type(),
            "event": event,
            "value": bound_values(target, value),
        })
    };

    Ok(Interaction::Push {
        event: event.to_string(),
        payload,
    })
}

fn anchor_navigation(target: &Element) -> Result<Interaction, ClientError> {
    let href = target.attr("href").unwrap_or_default();
    match target.attr(LINK_ATTR) {
        Some("patch") => Ok(Interaction::LivePatch {
            href: href.to_string(),
        }),
        Some("redirect") => Ok(Interaction::Redirect {
            to: href.to_string(),
        }),
        _ => Err(ClientError::NoEventBinding {
            binding: ViewEvent::Click.binding().to_string(),
            tag: target.tag.clone(),
        }),
    }
}

/// `wr-value-*` attributes plus the element's own `value`, merged with the
/// caller-supplied object (caller wins).
fn bound_values(target: &Element, extra: &Value) -> Value {
    let mut map = Map::new();
    if let Some(value) = target.attr("value") {
        map.insert("value".to_string(), Value::String(value.to_string()));
    }
    for (name, value) in target.attrs.iter() {
        if let Some(key) = name.strip_prefix(VALUE_PREFIX) {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    if let Value::Object(extra) = extra {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}

// =============================================================================
// Form Serialization
// =============================================================================

/// Nearest `<form>` ancestor of `target` within the document.
fn enclosing_form<'a>(nodes: &'a [Node], target: &Element) -> Option<&'a Element> {
    fn search<'a>(
        nodes: &'a [Node],
        target: &Element,
        stack: &mut Vec<&'a Element>,
    ) -> Option<Option<&'a Element>> {
        for node in nodes {
            let Some(el) = node.as_element() else { continue };
            if std::ptr::eq(el, target) {
                return Some(stack.iter().rev().copied().find(|a| a.tag == "form"));
            }
            stack.push(el);
            if let Some(found) = search(&el.children, target, stack) {
                return Some(found);
            }
            stack.pop();
        }
        None
    }
    search(nodes, target, &mut Vec::new())?
}

/// Serialize a form's controls following HTML form-submission defaults:
/// unchecked checkboxes and radios contribute nothing, single selects fall
/// back to their first option, multi-selects contribute every selected
/// option, disabled and nameless controls are skipped.
pub(crate) fn form_values(form: &Element) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    collect_controls(&form.children, &mut pairs);
    pairs
}

fn collect_controls(nodes: &[Node], pairs: &mut Vec<(String, String)>) {
    for node in nodes {
        let Some(el) = node.as_element() else { continue };
        match el.tag.as_str() {
            "input" => collect_input(el, pairs),
            "textarea" => {
                if let Some(name) = control_name(el) {
                    pairs.push((name.to_string(), text_of(el)));
                }
            }
            "select" => collect_select(el, pairs),
            _ => {}
        }
        collect_controls(&el.children, pairs);
    }
}

fn control_name(el: &Element) -> Option<&str> {
    if el.attrs.has("disabled") {
        return None;
    }
    el.attr("name").filter(|n| !n.is_empty())
}

fn collect_input(el: &Element, pairs: &mut Vec<(String, String)>) {
    let Some(name) = control_name(el) else { return };
    let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
    match kind.as_str() {
        "checkbox" | "radio" => {
            // Only checked toggles contribute; "on" is the browser default.
            if el.attrs.has("checked") {
                let value = el.attr("value").unwrap_or("on");
                pairs.push((name.to_string(), value.to_string()));
            }
        }
        "submit" | "button" | "image" | "reset" | "file" => {}
        _ => {
            pairs.push((name.to_string(), el.attr("value").unwrap_or_default().to_string()));
        }
    }
}

fn collect_select(el: &Element, pairs: &mut Vec<(String, String)>) {
    let Some(name) = control_name(el) else { return };
    let multiple = el.attrs.has("multiple")
        || el
            .attr("size")
            .and_then(|s| s.parse::<u32>().ok())
            .is_some_and(|size| size > 1);

    let options = option_elements(&el.children);
    let selected: Vec<&Element> = options
        .iter()
        .copied()
        .filter(|o| o.attrs.has("selected"))
        .collect();

    if multiple {
        for option in selected {
            pairs.push((name.to_string(), option_value(option)));
        }
    } else if let Some(option) = selected.last() {
        pairs.push((name.to_string(), option_value(option)));
    } else if let Some(first) = options.first() {
        // A single select always submits something: the first option wins
        // when nothing is marked selected.
        pairs.push((name.to_string(), option_value(first)));
    }
}

fn option_elements<'a>(nodes: &'a [Node]) -> Vec<&'a Element> {
    let mut options = Vec::new();
    for node in nodes {
        let Some(el) = node.as_element() else { continue };
        if el.tag == "option" {
            options.push(el);
        } else {
            // optgroup and friends.
            options.extend(option_elements(&el.children));
        }
    }
    options
}

fn option_value(option: &Element) -> String {
    match option.attr("value") {
        Some(value) => value.to_string(),
        None => text_content(option),
    }
}

fn text_of(el: &Element) -> String {
    el.children
        .iter()
        .filter_map(|n| match n {
            Node::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

/// Apply caller overrides onto serialized pairs: same-name pairs are
/// replaced, new names append.
fn apply_overrides(pairs: &mut Vec<(String, String)>, value: &Value) {
    let Value::Object(map) = value else { return };
    for (name, value) in map {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        pairs.retain(|(n, _)| n != name);
        pairs.push((name.clone(), value));
    }
}

/// Percent-encode pairs as `name=value&...`, order-preserving.
pub(crate) fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(name, FORM_ENCODE),
                utf8_percent_encode(value, FORM_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse::parse_fragment;

    fn doc(markup: &str) -> Vec<Node> {
        parse_fragment(markup).unwrap()
    }

    fn first_el(nodes: &[Node]) -> &Element {
        nodes[0].as_element().unwrap()
    }

    #[test]
    fn test_click_payload_merges_bound_values() {
        let nodes = doc(r#"<button wr-click="inc" wr-value-step="2">+</button>"#);
        let target = first_el(&nodes);
        let interaction =
            prepare(ViewEvent::Click, &nodes, target, &serde_json::json!({"from": "test"}))
                .unwrap();
        let Interaction::Push { event, payload } = interaction else {
            panic!("expected push");
        };
        assert_eq!(event, "inc");
        assert_eq!(payload["type"], "click");
        assert_eq!(payload["value"]["step"], "2");
        assert_eq!(payload["value"]["from"], "test");
    }

    #[test]
    fn test_click_without_binding_is_an_error() {
        let nodes = doc("<button>+</button>");
        let err = prepare(
            ViewEvent::Click,
            &nodes,
            first_el(&nodes),
            &Value::Object(Map::new()),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::NoEventBinding { .. }));
    }

    #[test]
    fn test_anchor_falls_back_to_navigation() {
        let nodes = doc(&format!(r#"<a href="/next" {LINK_ATTR}="patch">next</a>"#));
        let interaction = prepare(
            ViewEvent::Click,
            &nodes,
            first_el(&nodes),
            &Value::Object(Map::new()),
        )
        .unwrap();
        assert_eq!(
            interaction,
            Interaction::LivePatch {
                href: "/next".to_string()
            }
        );

        let nodes = doc(&format!(r#"<a href="/away" {LINK_ATTR}="redirect">go</a>"#));
        let interaction = prepare(
            ViewEvent::Click,
            &nodes,
            first_el(&nodes),
            &Value::Object(Map::new()),
        )
        .unwrap();
        assert_eq!(
            interaction,
            Interaction::Redirect {
                to: "/away".to_string()
            }
        );
    }

    #[test]
    fn test_form_defaulting_rules() {
        let nodes = doc(concat!(
            r#"<form wr-submit="save">"#,
            r#"<input name="q" value="rust">"#,
            r#"<input type="checkbox" name="on_box" checked>"#,
            r#"<input type="checkbox" name="off_box">"#,
            r#"<input type="radio" name="pick" value="a">"#,
            r#"<input type="radio" name="pick" value="b" checked>"#,
            r#"<input type="submit" name="ignored" value="Go">"#,
            r#"<input name="dead" value="x" disabled>"#,
            r#"<input value="unnamed">"#,
            r#"<textarea name="note">hello</textarea>"#,
            "</form>",
        ));
        let pairs = form_values(first_el(&nodes));
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "rust".to_string()),
                ("on_box".to_string(), "on".to_string()),
                ("pick".to_string(), "b".to_string()),
                ("note".to_string(), "hello".to_string()),
            ]
        );
    }

    #[test]
    fn test_select_single_defaults_to_first_option() {
        let nodes = doc(concat!(
            r#"<form wr-submit="save"><select name="lang">"#,
            r#"<option value="rs">Rust</option><option value="go">Go</option>"#,
            "</select></form>",
        ));
        let pairs = form_values(first_el(&nodes));
        assert_eq!(pairs, vec![("lang".to_string(), "rs".to_string())]);
    }

    #[test]
    fn test_select_multiple_contributes_every_selected() {
        let nodes = doc(concat!(
            r#"<form wr-submit="save"><select name="tag" multiple>"#,
            r#"<option value="a" selected>A</option>"#,
            r#"<option value="b">B</option>"#,
            r#"<option value="c" selected>C</option>"#,
            "</select></form>",
        ));
        let pairs = form_values(first_el(&nodes));
        assert_eq!(
            pairs,
            vec![
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_select_size_counts_as_multiple() {
        let nodes = doc(concat!(
            r#"<form wr-submit="save"><select name="tag" size="3">"#,
            r#"<option value="a">A</option>"#,
            "</select></form>",
        ));
        // size > 1 and nothing selected: nothing submits.
        assert!(form_values(first_el(&nodes)).is_empty());
    }

    #[test]
    fn test_submit_serializes_and_applies_overrides() {
        let nodes = doc(r#"<form wr-submit="save"><input name="a" value="1"><input name="b" value="2"></form>"#);
        let target = first_el(&nodes);
        let interaction = prepare(
            ViewEvent::Submit,
            &nodes,
            target,
            &serde_json::json!({"b": "9", "c": "3"}),
        )
        .unwrap();
        let Interaction::Push { payload, .. } = interaction else {
            panic!("expected push");
        };
        assert_eq!(payload["type"], "form");
        assert_eq!(payload["value"], "a=1&b=9&c=3");
    }

    #[test]
    fn test_change_from_input_finds_enclosing_form() {
        let nodes = doc(concat!(
            r#"<form wr-change="validate"><div>"#,
            r#"<input name="email" value="x@y" wr-change="validate">"#,
            "</div></form>",
        ));
        let form = first_el(&nodes);
        let input = form.children[0].as_element().unwrap().children[0]
            .as_element()
            .unwrap();
        let interaction = prepare(
            ViewEvent::Change,
            &nodes,
            input,
            &Value::Object(Map::new()),
        )
        .unwrap();
        let Interaction::Push { payload, .. } = interaction else {
            panic!("expected push");
        };
        assert_eq!(payload["value"], "email=x%40y");
    }

    #[test]
    fn test_encode_pairs_escapes_reserved() {
        let pairs = vec![("a b".to_string(), "1&2=3".to_string())];
        assert_eq!(encode_pairs(&pairs), "a%20b=1%262%3D3");
    }
}
