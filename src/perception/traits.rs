use std::time::Duration;

use async_trait::async_trait;

use crate::errors::WebClawResult;
use crate::perception::types::{BoundingBox, PageEvent, RawAxNode};

/// Low-level input events, dispatched at the protocol level.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    MouseMove { x: f64, y: f64 },
    MouseDown { x: f64, y: f64 },
    MouseUp { x: f64, y: f64 },
    Wheel { x: f64, y: f64, delta_y: f64 },
    /// Key down + up producing `text` (a single character).
    Char(char),
    /// Named key such as `Enter` or `Tab`.
    Key(String),
}

/// The capability surface the loop needs from a live browser page.
///
/// Implementations map a dead connection to `WebClawError::SessionLost`.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn accessibility_tree(&self) -> WebClawResult<Vec<RawAxNode>>;

    async fn screenshot(&self) -> WebClawResult<Vec<u8>>;

    /// Returns buffered console/network events and clears the buffer.
    async fn drain_events(&self) -> WebClawResult<Vec<PageEvent>>;

    async fn dispatch_input(&self, event: InputEvent) -> WebClawResult<()>;

    /// `None` when the node has no on-screen box (detached or hidden).
    async fn node_geometry(&self, backend_node_id: i64) -> WebClawResult<Option<BoundingBox>>;

    /// Waits for network and DOM activity to settle. `Ok(false)` on timeout.
    async fn wait_for_quiescence(&self, timeout: Duration) -> WebClawResult<bool>;

    async fn current_url(&self) -> WebClawResult<String>;

    async fn navigate(&self, url: &str) -> WebClawResult<()>;

    /// Draws a transient marker over `bbox`. Purely cosmetic.
    async fn highlight(&self, bbox: BoundingBox, duration: Duration) -> WebClawResult<()>;
}
