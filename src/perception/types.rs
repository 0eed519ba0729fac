use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one captured snapshot. Node references carry it so a reference
/// minted by one snapshot cannot resolve against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(uuid::Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot-scoped node identifier. Only [`Snapshot::resolve`] creates one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    snapshot: SnapshotId,
    node_id: String,
}

impl NodeRef {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Axis-aligned box in CSS pixels, viewport-relative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Builds a box from a CDP quad `[x1, y1, x2, y2, x3, y3, x4, y4]`.
    pub fn from_quad(quad: &[f64]) -> Option<Self> {
        if quad.len() < 8 {
            return None;
        }
        let xs = [quad[0], quad[2], quad[4], quad[6]];
        let ys = [quad[1], quad[3], quad[5], quad[7]];
        let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Accessibility node as delivered by the browser, before simplification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAxNode {
    pub node_id: String,
    pub role: Option<String>,
    pub name: Option<String>,
    pub ignored: bool,
    pub disabled: bool,
    pub hidden: bool,
    pub backend_node_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticNode {
    pub node_id: String,
    pub role: String,
    pub name: String,
    pub enabled: bool,
    pub visible: bool,
    /// Backend DOM id used to ask the browser for geometry at dispatch time.
    pub backend_node_id: Option<i64>,
}

impl SemanticNode {
    pub fn is_interactive(&self) -> bool {
        crate::perception::ax_tree::INTERACTIVE_ROLES.contains(&self.role.as_str())
    }
}

/// Role and accessible name of a node, independent of its snapshot-scoped id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetLabel {
    pub role: String,
    pub name: String,
}

impl From<&SemanticNode> for TargetLabel {
    fn from(node: &SemanticNode) -> Self {
        Self {
            role: node.role.clone(),
            name: node.name.clone(),
        }
    }
}

impl fmt::Display for TargetLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.role, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageEventKind {
    Console,
    PageError,
    RequestFailed,
    HttpError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEvent {
    pub kind: PageEventKind,
    pub text: String,
}

impl PageEvent {
    pub fn new(kind: PageEventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

impl fmt::Display for PageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PageEventKind::Console => write!(f, "{}", self.text),
            PageEventKind::PageError => write!(f, "Page Error: {}", self.text),
            PageEventKind::RequestFailed => write!(f, "Request Failed: {}", self.text),
            PageEventKind::HttpError => write!(f, "HTTP Error: {}", self.text),
        }
    }
}

/// One consolidated observation. Never mutated after capture.
#[derive(Debug)]
pub struct Snapshot {
    id: SnapshotId,
    pub image: Vec<u8>,
    pub nodes: Vec<SemanticNode>,
    pub events: Vec<PageEvent>,
    pub url: String,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl Snapshot {
    pub fn new(
        image: Vec<u8>,
        nodes: Vec<SemanticNode>,
        events: Vec<PageEvent>,
        url: String,
    ) -> Self {
        Self {
            id: SnapshotId::new(),
            image,
            nodes,
            events,
            url,
            captured_at: chrono::Utc::now(),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Binds a raw node id from this snapshot's node list to a [`NodeRef`].
    pub fn resolve(&self, node_id: &str) -> Option<NodeRef> {
        self.nodes
            .iter()
            .any(|n| n.node_id == node_id)
            .then(|| NodeRef {
                snapshot: self.id,
                node_id: node_id.to_string(),
            })
    }

    /// Looks a reference up; `None` if it belongs to another snapshot.
    pub fn node(&self, target: &NodeRef) -> Option<&SemanticNode> {
        if target.snapshot != self.id {
            return None;
        }
        self.nodes.iter().find(|n| n.node_id == target.node_id)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            snapshot_id: self.id,
            url: self.url.clone(),
            node_count: self.nodes.len(),
            event_count: self.events.len(),
        }
    }

    pub fn event_lines(&self) -> Vec<String> {
        self.events.iter().map(|e| e.to_string()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: SnapshotId,
    pub url: String,
    pub node_count: usize,
    pub event_count: usize,
}
