// Action dispatch: one validated decision in, one classified outcome out.
use std::time::Duration;

use crate::agent_engine::state::{Action, Decision, Outcome, ScrollDirection};
use crate::config::ExecutorConfig;
use crate::errors::{WebClawError, WebClawResult};
use crate::executor::coordinator::{self, Located};
use crate::executor::input;
use crate::perception::traits::BrowserSession;
use crate::perception::types::{BoundingBox, NodeRef, Snapshot};

pub struct ActionExecutor {
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Perform one action. Callers follow a successful dispatch with
    /// [`settle`](Self::settle).
    ///
    /// Only `SessionLost` escapes as an error; every other driver failure is
    /// classified into the returned [`Outcome`].
    pub async fn dispatch(
        &self,
        session: &dyn BrowserSession,
        snapshot: &Snapshot,
        decision: &Decision,
    ) -> WebClawResult<Outcome> {
        tracing::info!(action = %decision.action.kind(), "dispatching action");
        let result = match &decision.action {
            Action::Click { target } => self.click(session, snapshot, target).await,
            Action::Hover { target } => self.hover(session, snapshot, target).await,
            Action::Type { target, text } => self.type_into(session, snapshot, target, text).await,
            Action::Scroll { target, direction } => {
                self.scroll(session, snapshot, target, *direction).await
            }
            Action::Wait { milliseconds } => {
                let ms = (*milliseconds).min(self.config.max_wait_ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Outcome::Success)
            }
            Action::Navigate { url } => {
                let url = normalize_url(url);
                tracing::info!(url = %url, "navigating");
                session.navigate(&url).await.map(|_| Outcome::Success)
            }
            Action::Press { key } => input::press_key(session, key).await.map(|_| Outcome::Success),
            // Terminal decisions are handled by the loop and touch nothing.
            Action::Done { .. } | Action::Stuck { .. } => Ok(Outcome::Success),
        };
        classify(result)
    }

    /// Bounded wait for quiescence after an action.
    pub async fn settle(&self, session: &dyn BrowserSession) -> WebClawResult<Outcome> {
        let timeout = Duration::from_millis(self.config.quiescence_timeout_ms);
        match session.wait_for_quiescence(timeout).await {
            Ok(true) => Ok(Outcome::Success),
            Ok(false) => {
                tracing::warn!(timeout_ms = self.config.quiescence_timeout_ms, "page did not settle");
                Ok(Outcome::Timeout)
            }
            Err(e) => classify(Err(e)),
        }
    }

    async fn click(
        &self,
        session: &dyn BrowserSession,
        snapshot: &Snapshot,
        target: &NodeRef,
    ) -> WebClawResult<Outcome> {
        let bbox = match coordinator::locate(session, snapshot, target).await? {
            Located::At(bbox) => bbox,
            Located::Missing(detail) => return Ok(Outcome::ElementNotFound { detail }),
        };
        self.show(session, bbox).await;
        let (x, y) = coordinator::center_of(&bbox);
        tracing::debug!(x, y, "click");
        input::mouse_click(session, x, y, Duration::from_millis(self.config.click_hold_ms)).await?;
        Ok(Outcome::Success)
    }

    async fn hover(
        &self,
        session: &dyn BrowserSession,
        snapshot: &Snapshot,
        target: &NodeRef,
    ) -> WebClawResult<Outcome> {
        let bbox = match coordinator::locate(session, snapshot, target).await? {
            Located::At(bbox) => bbox,
            Located::Missing(detail) => return Ok(Outcome::ElementNotFound { detail }),
        };
        self.show(session, bbox).await;
        let (x, y) = coordinator::center_of(&bbox);
        tracing::debug!(x, y, "hover");
        input::mouse_move(session, x, y).await?;
        Ok(Outcome::Success)
    }

    async fn type_into(
        &self,
        session: &dyn BrowserSession,
        snapshot: &Snapshot,
        target: &NodeRef,
        text: &str,
    ) -> WebClawResult<Outcome> {
        // Focus first; a failed focus is the outcome.
        let focused = self.click(session, snapshot, target).await?;
        if focused.is_failure() {
            return Ok(focused);
        }
        input::type_text(session, text, Duration::from_millis(self.config.keystroke_delay_ms)).await?;
        Ok(Outcome::Success)
    }

    async fn scroll(
        &self,
        session: &dyn BrowserSession,
        snapshot: &Snapshot,
        target: &NodeRef,
        direction: ScrollDirection,
    ) -> WebClawResult<Outcome> {
        let bbox = match coordinator::locate(session, snapshot, target).await? {
            Located::At(bbox) => bbox,
            Located::Missing(detail) => return Ok(Outcome::ElementNotFound { detail }),
        };
        let (x, y) = coordinator::center_of(&bbox);
        let delta = match direction {
            ScrollDirection::Down => self.config.scroll_step_px,
            ScrollDirection::Up => -self.config.scroll_step_px,
        };
        input::wheel(session, x, y, delta).await?;
        Ok(Outcome::Success)
    }

    async fn show(&self, session: &dyn BrowserSession, bbox: BoundingBox) {
        if self.config.highlight_ms == 0 {
            return;
        }
        let duration = Duration::from_millis(self.config.highlight_ms);
        if let Err(e) = session.highlight(bbox, duration).await {
            tracing::warn!(error = %e, "highlight failed");
        }
    }
}

/// Keeps `SessionLost` fatal and turns other driver errors into an outcome.
fn classify(result: WebClawResult<Outcome>) -> WebClawResult<Outcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e @ WebClawError::SessionLost(_)) => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "driver error during action");
            Ok(Outcome::NavigationError { message: e.to_string() })
        }
    }
}

/// Bare hosts get an https scheme.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") || url.starts_with("about:") || url.starts_with("data:") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}
