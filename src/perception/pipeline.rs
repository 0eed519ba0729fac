//! Perception pipeline: settles the page, then gathers screenshot, semantic
//! tree and buffered events into a single `Snapshot`.
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::config::PerceptionConfig;
use crate::errors::WebClawResult;
use crate::perception::ax_tree;
use crate::perception::traits::BrowserSession;
use crate::perception::types::{PageEvent, Snapshot};

pub struct Perceiver {
    config: PerceptionConfig,
}

impl Perceiver {
    pub fn new(config: PerceptionConfig) -> Self {
        Self { config }
    }

    /// Run the capture sequence:
    ///
    /// 1. Wait (bounded) for quiescence so a half-rendered page is not observed.
    /// 2. Screenshot, accessibility tree and URL, concurrently.
    /// 3. Drain the event buffer last so events up to the capture moment are included.
    ///
    /// `SessionLost` from the browser propagates unchanged.
    pub async fn capture(&self, session: &dyn BrowserSession) -> WebClawResult<Snapshot> {
        let settle = Duration::from_millis(self.config.settle_timeout_ms);
        let settled = session.wait_for_quiescence(settle).await?;
        if !settled {
            tracing::debug!(timeout_ms = self.config.settle_timeout_ms, "page not quiescent; capturing anyway");
        }

        let (image, raw_nodes, url) = tokio::try_join!(
            session.screenshot(),
            session.accessibility_tree(),
            session.current_url(),
        )?;
        let events = session.drain_events().await?;

        let raw_count = raw_nodes.len();
        let nodes = ax_tree::simplify(raw_nodes);

        tracing::debug!(
            raw = raw_count,
            kept = nodes.len(),
            events = events.len(),
            image_bytes = image.len(),
            url = %url,
            "snapshot captured"
        );

        Ok(Snapshot::new(image, nodes, events, url))
    }
}

fn auth_failure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(401|403)\b|unauthori[sz]ed|forbidden|access denied|not authenticated")
            .expect("static regex is valid")
    })
}

/// Events that indicate an authorization failure. These are shown to the
/// model as context; they never end the run by themselves.
pub fn critical_signals(events: &[PageEvent]) -> Vec<&PageEvent> {
    let pattern = auth_failure_pattern();
    events.iter().filter(|e| pattern.is_match(&e.text)).collect()
}
