// Protocol-level input sequences with human-like timing.
use std::time::Duration;

use crate::errors::WebClawResult;
use crate::perception::traits::{BrowserSession, InputEvent};

pub async fn mouse_move(session: &dyn BrowserSession, x: f64, y: f64) -> WebClawResult<()> {
    session.dispatch_input(InputEvent::MouseMove { x, y }).await
}

/// Move, press, hold, release.
pub async fn mouse_click(
    session: &dyn BrowserSession,
    x: f64,
    y: f64,
    hold: Duration,
) -> WebClawResult<()> {
    mouse_move(session, x, y).await?;
    session.dispatch_input(InputEvent::MouseDown { x, y }).await?;
    tokio::time::sleep(hold).await;
    session.dispatch_input(InputEvent::MouseUp { x, y }).await
}

/// One key event per character, spaced by `delay`.
pub async fn type_text(
    session: &dyn BrowserSession,
    text: &str,
    delay: Duration,
) -> WebClawResult<()> {
    for (i, ch) in text.chars().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        session.dispatch_input(InputEvent::Char(ch)).await?;
    }
    Ok(())
}

pub async fn wheel(session: &dyn BrowserSession, x: f64, y: f64, delta_y: f64) -> WebClawResult<()> {
    mouse_move(session, x, y).await?;
    session.dispatch_input(InputEvent::Wheel { x, y, delta_y }).await
}

pub async fn press_key(session: &dyn BrowserSession, key: &str) -> WebClawResult<()> {
    session.dispatch_input(InputEvent::Key(key.to_string())).await
}
