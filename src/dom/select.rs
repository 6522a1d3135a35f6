//! CSS-like element selection with text filtering.
//!
//! Supports the selector subset interaction tests need: tag names, `#id`,
//! `.class`, `[attr]` / `[attr=value]`, `*`, and descendant chains. Every
//! failure carries the selector text and a snippet of the search scope so
//! the caller gets an actionable message instead of a bare miss.

use thiserror::Error;

use super::{Element, Node, render};

// =============================================================================
// Errors
// =============================================================================

/// Selection failures; local to one interaction, never session-fatal.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid selector {selector:?}: {reason}")]
    Parse { selector: String, reason: String },

    #[error("selector {selector:?} did not match any element within:\n{scope}")]
    NoMatch { selector: String, scope: String },

    #[error("selector {selector:?} matched {count} elements, expected one, within:\n{scope}")]
    ManyMatches {
        selector: String,
        count: usize,
        scope: String,
    },

    #[error(
        "selector {selector:?} matched elements, but none with text {filter:?}, within:\n{scope}"
    )]
    NoMatchAfterFilter {
        selector: String,
        filter: String,
        scope: String,
    },

    #[error(
        "selector {selector:?} with text {filter:?} matched {count} elements, expected one, within:\n{scope}"
    )]
    ManyAfterFilter {
        selector: String,
        filter: String,
        count: usize,
        scope: String,
    },
}

// =============================================================================
// Selector Model
// =============================================================================

/// A parsed selector: descendant chain of compound selectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    compounds: Vec<Compound>,
    source: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Selector {
    /// Parse a selector string.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let source = input.trim();
        if source.is_empty() {
            return Err(SelectorError::Parse {
                selector: input.to_string(),
                reason: "empty selector".to_string(),
            });
        }

        let compounds = source
            .split_whitespace()
            .map(|part| parse_compound(part, input))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            compounds,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn parse_compound(part: &str, full: &str) -> Result<Compound, SelectorError> {
    let err = |reason: &str| SelectorError::Parse {
        selector: full.to_string(),
        reason: reason.to_string(),
    };

    let mut compound = Compound::default();
    let mut chars = part.chars().peekable();
    let mut universal = false;

    // Leading tag name or universal.
    if chars.peek() == Some(&'*') {
        chars.next();
        universal = true;
    } else if chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
        let mut tag = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '-' {
                tag.push(c);
                chars.next();
            } else {
                break;
            }
        }
        compound.tag = Some(tag.to_ascii_lowercase());
    }

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                let id = take_name(&mut chars);
                if id.is_empty() {
                    return Err(err("expected id after '#'"));
                }
                compound.id = Some(id);
            }
            '.' => {
                let class = take_name(&mut chars);
                if class.is_empty() {
                    return Err(err("expected class after '.'"));
                }
                compound.classes.push(class);
            }
            '[' => {
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(err("unterminated attribute selector"));
                }
                match body.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim_matches(['"', '\'']);
                        compound
                            .attrs
                            .push((name.trim().to_string(), Some(value.to_string())));
                    }
                    None => {
                        if body.trim().is_empty() {
                            return Err(err("empty attribute selector"));
                        }
                        compound.attrs.push((body.trim().to_string(), None));
                    }
                }
            }
            other => {
                return Err(err(&format!("unexpected character {other:?}")));
            }
        }
    }

    if !universal && compound == Compound::default() {
        return Err(err("selector part matches nothing"));
    }
    Ok(compound)
}

fn take_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':') {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    name
}

// =============================================================================
// Matching
// =============================================================================

impl Compound {
    fn matches(&self, el: &Element) -> bool {
        if let Some(tag) = &self.tag
            && el.tag != *tag
        {
            return false;
        }
        if let Some(id) = &self.id
            && el.id() != Some(id.as_str())
        {
            return false;
        }
        for class in &self.classes {
            let has = el
                .attrs
                .get("class")
                .is_some_and(|v| v.split_whitespace().any(|c| c == class));
            if !has {
                return false;
            }
        }
        for (name, value) in &self.attrs {
            match (el.attrs.get(name), value) {
                (Some(actual), Some(expected)) if actual == expected => {}
                (Some(_), None) => {}
                _ => return false,
            }
        }
        true
    }
}

/// All elements matching `selector` within the fragment, document order.
pub fn select<'a>(nodes: &'a [Node], selector: &Selector) -> Vec<&'a Element> {
    let mut matched = Vec::new();
    let mut ancestors: Vec<&Element> = Vec::new();
    collect(nodes, selector, &mut ancestors, &mut matched);
    matched
}

fn collect<'a>(
    nodes: &'a [Node],
    selector: &Selector,
    ancestors: &mut Vec<&'a Element>,
    matched: &mut Vec<&'a Element>,
) {
    for node in nodes {
        let Some(el) = node.as_element() else { continue };
        if chain_matches(selector, el, ancestors) {
            matched.push(el);
        }
        ancestors.push(el);
        collect(&el.children, selector, ancestors, matched);
        ancestors.pop();
    }
}

fn chain_matches(selector: &Selector, el: &Element, ancestors: &[&Element]) -> bool {
    let (last, rest) = selector
        .compounds
        .split_last()
        .expect("parsed selector has at least one compound");
    if !last.matches(el) {
        return false;
    }
    // Remaining compounds must match ancestors in order, outermost first.
    let mut candidates = ancestors.iter();
    'compound: for compound in rest {
        for ancestor in candidates.by_ref() {
            if compound.matches(ancestor) {
                continue 'compound;
            }
        }
        return false;
    }
    true
}

/// Concatenated descendant text of an element, whitespace-normalized.
pub fn text_content(el: &Element) -> String {
    let mut text = String::new();
    gather_text(&el.children, &mut text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn gather_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => {
                out.push_str(t);
                out.push(' ');
            }
            Node::Element(el) => gather_text(&el.children, out),
            _ => {}
        }
    }
}

/// Select exactly one element, applying an optional text filter.
///
/// The filter keeps elements whose normalized text contains `filter`.
pub fn select_one<'a>(
    nodes: &'a [Node],
    selector: &str,
    filter: Option<&str>,
) -> Result<&'a Element, SelectorError> {
    let parsed = Selector::parse(selector)?;
    let matches = select(nodes, &parsed);

    if matches.is_empty() {
        return Err(SelectorError::NoMatch {
            selector: parsed.source().to_string(),
            scope: scope_snippet(nodes),
        });
    }

    match filter {
        None => match matches.as_slice() {
            [one] => Ok(one),
            many => Err(SelectorError::ManyMatches {
                selector: parsed.source().to_string(),
                count: many.len(),
                scope: scope_snippet(nodes),
            }),
        },
        Some(filter) => {
            let filtered: Vec<_> = matches
                .into_iter()
                .filter(|el| text_content(el).contains(filter))
                .collect();
            match filtered.as_slice() {
                [] => Err(SelectorError::NoMatchAfterFilter {
                    selector: parsed.source().to_string(),
                    filter: filter.to_string(),
                    scope: scope_snippet(nodes),
                }),
                [one] => Ok(one),
                many => Err(SelectorError::ManyAfterFilter {
                    selector: parsed.source().to_string(),
                    filter: filter.to_string(),
                    count: many.len(),
                    scope: scope_snippet(nodes),
                }),
            }
        }
    }
}

fn scope_snippet(nodes: &[Node]) -> String {
    const MAX: usize = 200;
    let markup = render::to_markup(nodes);
    if markup.len() <= MAX {
        return markup;
    }
    let mut end = MAX;
    while !markup.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &markup[..end])
}
