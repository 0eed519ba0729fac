// Target resolution: snapshot-scoped reference -> live on-screen box.
use crate::errors::WebClawResult;
use crate::perception::traits::BrowserSession;
use crate::perception::types::{BoundingBox, NodeRef, Snapshot};

/// Where a target ended up when it was looked up at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum Located {
    At(BoundingBox),
    /// The node cannot be interacted with; the string says why.
    Missing(String),
}

/// Center of a box, the point every pointer action aims at.
pub fn center_of(bbox: &BoundingBox) -> (f64, f64) {
    (bbox.x + bbox.width / 2.0, bbox.y + bbox.height / 2.0)
}

/// Resolves `target` against the snapshot it was issued from, then asks the
/// browser for its current geometry. Driver errors propagate.
pub async fn locate(
    session: &dyn BrowserSession,
    snapshot: &Snapshot,
    target: &NodeRef,
) -> WebClawResult<Located> {
    let Some(node) = snapshot.node(target) else {
        return Ok(Located::Missing(format!(
            "node {} does not belong to snapshot {}",
            target.node_id(),
            snapshot.id()
        )));
    };
    let Some(backend_id) = node.backend_node_id else {
        return Ok(Located::Missing(format!(
            "{} \"{}\" has no DOM node",
            node.role, node.name
        )));
    };

    match session.node_geometry(backend_id).await? {
        Some(bbox) if !bbox.is_empty() => Ok(Located::At(bbox)),
        Some(_) => Ok(Located::Missing(format!(
            "{} \"{}\" has an empty box",
            node.role, node.name
        ))),
        None => Ok(Located::Missing(format!(
            "{} \"{}\" is detached or not rendered",
            node.role, node.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_midpoint() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(center_of(&bbox), (60.0, 40.0));
    }
}
