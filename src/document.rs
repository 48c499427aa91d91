//! Minimal document tree carrying prerendered component placeholders.
//!
//! The server embeds circuit, renderer and component ids in the markup it
//! delivers; the client finds them again during discovery. Two encodings
//! exist:
//!
//! - attributes on a placeholder element (`data-component-id`,
//!   `data-circuit-id`, `data-renderer-id`)
//! - a pair of boundary comments in one sibling list:
//!   `circuit-component: {"componentId":..,"circuitId":..,"rendererId":..}`
//!   followed later by `circuit-component: <componentId>`

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::{CircuitId, ComponentId, RendererId};

/// Attribute holding the component id of an element placeholder.
pub const COMPONENT_ID_ATTR: &str = "data-component-id";
/// Attribute holding the circuit id of an element placeholder.
pub const CIRCUIT_ID_ATTR: &str = "data-circuit-id";
/// Attribute holding the renderer id of an element placeholder.
pub const RENDERER_ID_ATTR: &str = "data-renderer-id";

/// Prefix shared by both boundary comments.
pub const MARKER_PREFIX: &str = "circuit-component:";

static START_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*circuit-component:\s*(?P<json>\{.*)$").expect("valid start marker pattern")
});

static END_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*circuit-component:\s*(?P<id>\d+)\s*$").expect("valid end marker pattern")
});

/// A node of the delivered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// An element with attributes and children.
    Element(Element),
    /// A comment; boundary markers live here.
    Comment(String),
    /// Plain text.
    Text(String),
}

impl Node {
    /// Comment node.
    pub fn comment(text: impl Into<String>) -> Self {
        Self::Comment(text.into())
    }

    /// Text node.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Self::Element(element)
    }
}

/// An element node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    /// Tag name.
    pub tag: String,
    /// Attributes by name.
    pub attributes: BTreeMap<String, String>,
    /// Child nodes in document order.
    pub children: Vec<Node>,
}

impl Element {
    /// Empty element.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Builder: set an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: append a child.
    #[must_use]
    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Builder: append several children.
    #[must_use]
    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Attribute value, if present.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Index path from the document root to a node.
pub type NodePath = Vec<usize>;

/// The delivered document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    /// Top-level nodes.
    pub children: Vec<Node>,
}

impl Document {
    /// Document with the given top-level nodes.
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    /// Node at `path`, if the path is valid.
    pub fn node_at(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children.get(*first)?;
        for index in rest {
            match node {
                Node::Element(element) => node = element.children.get(*index)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Children of the node at `path`; the empty path is the root.
    pub fn children_at(&self, path: &[usize]) -> Option<&[Node]> {
        if path.is_empty() {
            return Some(&self.children);
        }
        match self.node_at(path)? {
            Node::Element(element) => Some(&element.children),
            _ => None,
        }
    }
}

/// Ids recorded in a start marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerPayload {
    /// Root component id.
    pub component_id: ComponentId,
    /// Circuit that owns the component.
    pub circuit_id: CircuitId,
    /// Renderer that produced the markup.
    pub renderer_id: RendererId,
}

/// How a comment reads as a boundary marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MarkerComment<'a> {
    /// Not a marker at all.
    Plain,
    /// `circuit-component: {json}`; the JSON is unparsed.
    Start(&'a str),
    /// `circuit-component: <id>`.
    End(ComponentId),
    /// Carries the prefix but neither shape.
    Unrecognized,
}

pub(crate) fn classify_comment(text: &str) -> MarkerComment<'_> {
    if !text.trim_start().starts_with(MARKER_PREFIX) {
        return MarkerComment::Plain;
    }
    if let Some(caps) = END_MARKER.captures(text) {
        if let Ok(id) = caps["id"].parse() {
            return MarkerComment::End(ComponentId(id));
        }
    }
    match START_MARKER.captures(text).and_then(|caps| caps.name("json")) {
        Some(json) => MarkerComment::Start(json.as_str().trim_end()),
        None => MarkerComment::Unrecognized,
    }
}

/// Text of a start marker comment.
pub fn start_marker_text(payload: &MarkerPayload) -> Result<String, serde_json::Error> {
    Ok(format!("{} {}", MARKER_PREFIX, serde_json::to_string(payload)?))
}

/// Text of an end marker comment.
pub fn end_marker_text(component_id: ComponentId) -> String {
    format!("{} {}", MARKER_PREFIX, component_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_markers() {
        let payload = MarkerPayload {
            component_id: ComponentId(4),
            circuit_id: CircuitId::from("c"),
            renderer_id: RendererId(1),
        };
        let start = start_marker_text(&payload).unwrap();
        match classify_comment(&start) {
            MarkerComment::Start(json) => {
                assert_eq!(serde_json::from_str::<MarkerPayload>(json).unwrap(), payload);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            classify_comment(&end_marker_text(ComponentId(4))),
            MarkerComment::End(ComponentId(4))
        );
        assert_eq!(classify_comment(" just a comment "), MarkerComment::Plain);
        assert_eq!(
            classify_comment("circuit-component: ???"),
            MarkerComment::Unrecognized
        );
    }

    #[test]
    fn test_start_marker_uses_camel_case_keys() {
        let text = start_marker_text(&MarkerPayload {
            component_id: ComponentId(1),
            circuit_id: CircuitId::from("abc"),
            renderer_id: RendererId(2),
        })
        .unwrap();
        assert_eq!(
            text,
            r#"circuit-component: {"componentId":1,"circuitId":"abc","rendererId":2}"#
        );
    }

    #[test]
    fn test_node_at_follows_paths() {
        let doc = Document::new(vec![
            Node::text("a"),
            Element::new("div")
                .with_child(Node::comment("x"))
                .with_child(Element::new("span"))
                .into(),
        ]);
        assert_eq!(doc.node_at(&[1, 0]), Some(&Node::comment("x")));
        assert!(matches!(doc.node_at(&[1, 1]), Some(Node::Element(e)) if e.tag == "span"));
        assert_eq!(doc.node_at(&[0, 0]), None);
        assert_eq!(doc.node_at(&[]), None);
        assert_eq!(doc.children_at(&[]).map(<[Node]>::len), Some(2));
    }
}
