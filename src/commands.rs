use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::agent_engine::state::{AgentEvent, Goal};

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    step_by_step: bool,
}

/// Parses one inbound control line.
///
/// `{"type":"stop"}` stops, `{"type":"next_step"}` resumes a paused run,
/// `{"goal":..,"step_by_step":..}` starts one. A line that is not JSON is
/// taken as a goal verbatim. Returns `None` for anything unrecognised.
pub fn parse_control_message(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg: ControlMessage = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(_) if !line.starts_with('{') => {
            return Some(AgentEvent::GoalReceived(Goal::new(line, false)));
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed control message ignored");
            return None;
        }
    };

    match msg.kind.as_deref() {
        Some("stop") => Some(AgentEvent::Stop),
        Some("next_step") | Some("resume") => Some(AgentEvent::Resume),
        Some("shutdown") => Some(AgentEvent::Shutdown),
        Some("start") | None => msg
            .goal
            .filter(|g| !g.trim().is_empty())
            .map(|g| AgentEvent::GoalReceived(Goal::new(g.trim(), msg.step_by_step))),
        Some(other) => {
            tracing::warn!(kind = other, "unknown control message type ignored");
            None
        }
    }
}

/// Forwards control lines from stdin to the engine until EOF, then asks it
/// to exit once the current run is over.
pub async fn pump_stdin(tx: mpsc::Sender<AgentEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(event) = parse_control_message(&line) else {
                    continue;
                };
                tracing::debug!(?event, "control message received");
                if tx.send(event).await.is_err() {
                    tracing::info!("engine gone; stdin pump exiting");
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        }
    }
    let _ = tx.send(AgentEvent::Shutdown).await;
}
