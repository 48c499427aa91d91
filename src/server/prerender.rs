//! Prerendering support: where a circuit runs and how its placeholders are
//! embedded in the delivered document.

use std::fmt;

use url::Url;

use crate::document::{
    end_marker_text, start_marker_text, Element, MarkerPayload, Node, CIRCUIT_ID_ATTR,
    COMPONENT_ID_ATTR, RENDERER_ID_ATTR,
};
use crate::protocol::{CircuitId, ComponentId, RendererId};

/// Page a circuit renders for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitLocation {
    location: Url,
    base: Url,
}

impl CircuitLocation {
    /// Parse a location and base URI. The base always ends with `/`.
    pub fn new(location_uri: &str, base_uri: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base_uri)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let location = base.join(location_uri)?;
        Ok(Self { location, base })
    }

    /// Absolute page URI.
    pub fn location_uri(&self) -> &str {
        self.location.as_str()
    }

    /// Normalized base URI.
    pub fn base_uri(&self) -> &str {
        self.base.as_str()
    }

    /// Location relative to the base, or the full URI when it lies outside.
    pub fn relative_path(&self) -> &str {
        self.location
            .as_str()
            .strip_prefix(self.base.as_str())
            .unwrap_or(self.location.as_str())
    }
}

impl fmt::Display for CircuitLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.location.as_str())
    }
}

/// Element placeholder carrying the ids as attributes.
pub fn element_placeholder(
    tag: &str,
    circuit_id: &CircuitId,
    renderer_id: RendererId,
    component_id: ComponentId,
) -> Element {
    Element::new(tag)
        .with_attribute(COMPONENT_ID_ATTR, component_id.to_string())
        .with_attribute(CIRCUIT_ID_ATTR, circuit_id.as_ref())
        .with_attribute(RENDERER_ID_ATTR, renderer_id.to_string())
}

/// Prerendered `content` wrapped in a start and end boundary comment.
pub fn boundary_placeholder(
    circuit_id: &CircuitId,
    renderer_id: RendererId,
    component_id: ComponentId,
    content: Vec<Node>,
) -> Result<Vec<Node>, serde_json::Error> {
    let start = start_marker_text(&MarkerPayload {
        component_id,
        circuit_id: circuit_id.clone(),
        renderer_id,
    })?;
    let mut nodes = Vec::with_capacity(content.len() + 2);
    nodes.push(Node::Comment(start));
    nodes.extend(content);
    nodes.push(Node::Comment(end_marker_text(component_id)));
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_uri_gets_trailing_slash() {
        let location = CircuitLocation::new("http://example.com/app/counter", "http://example.com/app").unwrap();
        assert_eq!(location.base_uri(), "http://example.com/app/");
        assert_eq!(location.location_uri(), "http://example.com/app/counter");
        assert_eq!(location.relative_path(), "counter");
    }

    #[test]
    fn test_relative_location_resolves_against_base() {
        let location = CircuitLocation::new("fetch-data?x=1", "http://example.com/").unwrap();
        assert_eq!(location.location_uri(), "http://example.com/fetch-data?x=1");
    }

    #[test]
    fn test_invalid_base_is_rejected() {
        assert!(CircuitLocation::new("/", "not a url").is_err());
    }

    #[test]
    fn test_boundary_placeholder_wraps_content() {
        let nodes = boundary_placeholder(
            &CircuitId::from("c1"),
            RendererId(3),
            ComponentId(0),
            vec![Node::text("hello")],
        )
        .unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[1], Node::text("hello"));
        assert_eq!(nodes[2], Node::comment("circuit-component: 0"));
    }

    #[test]
    fn test_element_placeholder_attributes() {
        let element = element_placeholder("app", &CircuitId::from("c1"), RendererId(3), ComponentId(7));
        assert_eq!(element.attribute(COMPONENT_ID_ATTR), Some("7"));
        assert_eq!(element.attribute(CIRCUIT_ID_ATTR), Some("c1"));
        assert_eq!(element.attribute(RENDERER_ID_ATTR), Some("3"));
    }
}
