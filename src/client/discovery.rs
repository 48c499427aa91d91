//! Discovery of prerendered components in the delivered document.
//!
//! Walks the tree in document order with an explicit stack, collecting
//! element placeholders and boundary comment pairs. A matched region is
//! never descended into. Broken markers are reported and skipped; they do
//! not stop discovery of the remaining entries.

use anyhow::Context;

use crate::document::{
    classify_comment, Document, Element, MarkerComment, MarkerPayload, Node, NodePath,
    CIRCUIT_ID_ATTR, COMPONENT_ID_ATTR, RENDERER_ID_ATTR,
};
use crate::protocol::{CircuitId, ComponentId, RendererId};

/// Where a discovered component lives in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// An element placeholder at `path`.
    Element {
        /// Path of the placeholder element.
        path: NodePath,
    },
    /// The siblings strictly between two boundary comments.
    Region {
        /// Path of the parent whose children hold the markers.
        parent: NodePath,
        /// Index of the start marker.
        start: usize,
        /// Index of the end marker.
        end: usize,
    },
}

/// Binds a live component runtime to a placeholder.
pub trait ComponentAttacher {
    /// Attach `component_id` of `renderer_id` to `target`.
    fn attach(
        &mut self,
        renderer_id: RendererId,
        component_id: ComponentId,
        target: &AttachTarget,
    ) -> anyhow::Result<()>;
}

/// A prerendered component found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentEntry {
    /// Root component id.
    pub component_id: ComponentId,
    /// Circuit owning the component.
    pub circuit_id: CircuitId,
    /// Renderer that produced it.
    pub renderer_id: RendererId,
    /// Placeholder location.
    pub target: AttachTarget,
}

impl ComponentEntry {
    /// Bind the component runtime to this entry's placeholder.
    pub fn initialize<A>(&self, attacher: &mut A) -> anyhow::Result<()>
    where
        A: ComponentAttacher + ?Sized,
    {
        attacher
            .attach(self.renderer_id, self.component_id, &self.target)
            .with_context(|| {
                format!(
                    "Failed to attach component {} of circuit {}",
                    self.component_id, self.circuit_id
                )
            })
    }
}

/// Why a marker was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerDefect {
    /// The start marker's JSON could not be read.
    #[error("invalid marker payload: {0}")]
    InvalidPayload(String),
    /// An element placeholder lacks one of the id attributes.
    #[error("placeholder is missing attribute {0}")]
    MissingAttribute(&'static str),
    /// An element placeholder attribute does not hold a valid id.
    #[error("placeholder attribute {name} has invalid value {value:?}")]
    InvalidAttribute {
        /// Attribute name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// No end marker follows the start marker in its sibling list.
    #[error("start marker for component {0} has no end marker")]
    Unterminated(ComponentId),
    /// An end marker with no start marker before it.
    #[error("end marker for component {0} has no start marker")]
    UnmatchedEnd(ComponentId),
}

/// A rejected marker and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMarker {
    /// Path of the offending node.
    pub path: NodePath,
    /// What is wrong with it.
    pub defect: MarkerDefect,
}

/// Everything discovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Valid entries in document order.
    pub entries: Vec<ComponentEntry>,
    /// Rejected markers in document order.
    pub malformed: Vec<MalformedMarker>,
}

impl Discovery {
    /// Distinct circuit ids in order of first appearance.
    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        let mut ids: Vec<CircuitId> = Vec::new();
        for entry in &self.entries {
            if !ids.contains(&entry.circuit_id) {
                ids.push(entry.circuit_id.clone());
            }
        }
        ids
    }

    /// Whether no component was found.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn child_path(parent: &[usize], index: usize) -> NodePath {
    let mut path = parent.to_vec();
    path.push(index);
    path
}

fn parse_attribute<T: std::str::FromStr>(element: &Element, name: &'static str) -> Result<T, MarkerDefect> {
    let value = element
        .attribute(name)
        .ok_or(MarkerDefect::MissingAttribute(name))?;
    value.trim().parse().map_err(|_parse| MarkerDefect::InvalidAttribute {
        name,
        value: value.to_string(),
    })
}

fn parse_placeholder(element: &Element) -> Result<(ComponentId, CircuitId, RendererId), MarkerDefect> {
    let component_id = ComponentId(parse_attribute(element, COMPONENT_ID_ATTR)?);
    let circuit_id: String = parse_attribute(element, CIRCUIT_ID_ATTR)?;
    if circuit_id.is_empty() {
        return Err(MarkerDefect::InvalidAttribute {
            name: CIRCUIT_ID_ATTR,
            value: circuit_id,
        });
    }
    let renderer_id = RendererId(parse_attribute(element, RENDERER_ID_ATTR)?);
    Ok((component_id, CircuitId(circuit_id), renderer_id))
}

fn element_entry(element: &Element) -> Option<Result<(ComponentId, CircuitId, RendererId), MarkerDefect>> {
    let is_placeholder = [COMPONENT_ID_ATTR, CIRCUIT_ID_ATTR, RENDERER_ID_ATTR]
        .iter()
        .any(|name| element.attribute(name).is_some());
    is_placeholder.then(|| parse_placeholder(element))
}

/// What to do with the current sibling list after looking at one node.
enum Step {
    Advance(usize),
    Descend(usize),
}

/// Find every prerendered component in `document`.
pub fn discover(document: &Document) -> Discovery {
    let mut found = Discovery::default();
    // Each frame is a sibling list being scanned: (parent path, next index).
    let mut stack: Vec<(NodePath, usize)> = vec![(Vec::new(), 0)];

    while let Some((parent, index)) = stack.last().cloned() {
        let Some(siblings) = document.children_at(&parent) else {
            stack.pop();
            continue;
        };
        let Some(node) = siblings.get(index) else {
            stack.pop();
            continue;
        };

        let step = match node {
            Node::Text(_) => Step::Advance(index + 1),
            Node::Element(element) => match element_entry(element) {
                None => Step::Descend(index + 1),
                Some(Ok((component_id, circuit_id, renderer_id))) => {
                    found.entries.push(ComponentEntry {
                        component_id,
                        circuit_id,
                        renderer_id,
                        target: AttachTarget::Element {
                            path: child_path(&parent, index),
                        },
                    });
                    Step::Advance(index + 1)
                }
                Some(Err(defect)) => {
                    report(&mut found, child_path(&parent, index), defect);
                    Step::Advance(index + 1)
                }
            },
            Node::Comment(text) => scan_comment(&mut found, &parent, siblings, index, text),
        };

        let Some(top) = stack.last_mut() else { break };
        match step {
            Step::Advance(next) => top.1 = next,
            Step::Descend(next) => {
                top.1 = next;
                stack.push((child_path(&parent, index), 0));
            }
        }
    }

    found
}

fn scan_comment(found: &mut Discovery, parent: &[usize], siblings: &[Node], index: usize, text: &str) -> Step {
    match classify_comment(text) {
        MarkerComment::Plain => Step::Advance(index + 1),
        MarkerComment::Unrecognized => {
            report(
                found,
                child_path(parent, index),
                MarkerDefect::InvalidPayload("unrecognized marker".to_string()),
            );
            Step::Advance(index + 1)
        }
        MarkerComment::End(component_id) => {
            report(found, child_path(parent, index), MarkerDefect::UnmatchedEnd(component_id));
            Step::Advance(index + 1)
        }
        MarkerComment::Start(json) => {
            let payload: MarkerPayload = match serde_json::from_str(json) {
                Ok(payload) => payload,
                Err(e) => {
                    report(found, child_path(parent, index), MarkerDefect::InvalidPayload(e.to_string()));
                    return Step::Advance(index + 1);
                }
            };
            let end = siblings
                .iter()
                .enumerate()
                .skip(index + 1)
                .find_map(|(i, node)| match node {
                    Node::Comment(text) if classify_comment(text) == MarkerComment::End(payload.component_id) => {
                        Some(i)
                    }
                    _ => None,
                });
            match end {
                Some(end) if payload.circuit_id.as_ref().trim().is_empty() => {
                    report(
                        found,
                        child_path(parent, index),
                        MarkerDefect::InvalidPayload("empty circuitId".to_string()),
                    );
                    Step::Advance(end + 1)
                }
                Some(end) => {
                    found.entries.push(ComponentEntry {
                        component_id: payload.component_id,
                        circuit_id: payload.circuit_id,
                        renderer_id: payload.renderer_id,
                        target: AttachTarget::Region {
                            parent: parent.to_vec(),
                            start: index,
                            end,
                        },
                    });
                    Step::Advance(end + 1)
                }
                None => {
                    report(
                        found,
                        child_path(parent, index),
                        MarkerDefect::Unterminated(payload.component_id),
                    );
                    Step::Advance(index + 1)
                }
            }
        }
    }
}

fn report(found: &mut Discovery, path: NodePath, defect: MarkerDefect) {
    log::warn!("Ignoring malformed component marker at {:?}: {}", path, defect);
    found.malformed.push(MalformedMarker { path, defect });
}
