//! Schema validation for the reasoning backend's reply.
//!
//! The reply is untrusted free-form text; this module turns it into a
//! [`Decision`] bound to the snapshot it was produced for, or explains why
//! it cannot.
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::agent_engine::state::{Action, ActionKind, Decision, ScrollDirection};
use crate::config::ExecutorConfig;
use crate::perception::types::Snapshot;

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    action: Option<RawAction>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "nodeId", alias = "node_id", default)]
    node_id: Option<serde_json::Value>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Why a reply was rejected; sent back to the model in the corrective note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation(pub String);

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("static regex is valid")
    })
}

/// Extracts the JSON object from a reply that may be fenced or padded with prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = fence_pattern()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    let start = inner.find('{')?;
    let end = inner.rfind('}')?;
    (end > start).then(|| &inner[start..=end])
}

pub fn parse_decision(
    text: &str,
    snapshot: &Snapshot,
    limits: &ExecutorConfig,
) -> Result<Decision, SchemaViolation> {
    let json = extract_json(text)
        .ok_or_else(|| SchemaViolation("reply did not contain a JSON object".into()))?;
    let raw: RawDecision = serde_json::from_str(json)
        .map_err(|e| SchemaViolation(format!("reply is not valid JSON for the schema: {e}")))?;

    let proposed = raw
        .action
        .ok_or_else(|| SchemaViolation("missing \"action\" object".into()))?;
    let kind_text = proposed
        .kind
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| SchemaViolation("missing action \"type\"".into()))?;
    let kind = ActionKind::parse(kind_text)
        .ok_or_else(|| SchemaViolation(format!("unsupported action type \"{kind_text}\"")))?;

    let value = proposed.value.as_ref().and_then(scalar_text);

    let target = if kind.needs_target() {
        let node_id = proposed
            .node_id
            .as_ref()
            .and_then(scalar_text)
            .ok_or_else(|| SchemaViolation(format!("\"{kind}\" requires a nodeId")))?;
        let target = snapshot.resolve(&node_id).ok_or_else(|| {
            SchemaViolation(format!(
                "nodeId \"{node_id}\" is not in the current node list"
            ))
        })?;
        Some(target)
    } else {
        None
    };

    let action = match (kind, target) {
        (ActionKind::Click, Some(target)) => Action::Click { target },
        (ActionKind::Hover, Some(target)) => Action::Hover { target },
        (ActionKind::Type, Some(target)) => Action::Type {
            target,
            text: value.ok_or_else(|| SchemaViolation("\"type\" requires a value".into()))?,
        },
        (ActionKind::Scroll, Some(target)) => Action::Scroll {
            target,
            direction: match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("up") => ScrollDirection::Up,
                _ => ScrollDirection::Down,
            },
        },
        (ActionKind::Wait, _) => Action::Wait {
            milliseconds: value
                .as_deref()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(limits.default_wait_ms)
                .min(limits.max_wait_ms),
        },
        (ActionKind::Navigate, _) => Action::Navigate {
            url: value
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SchemaViolation("\"navigate\" requires a URL value".into()))?,
        },
        (ActionKind::Press, _) => Action::Press {
            key: value
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SchemaViolation("\"press\" requires a key value".into()))?,
        },
        (ActionKind::Done, _) => Action::Done {
            summary: proposed.reason.clone().or(value).unwrap_or_default(),
        },
        (ActionKind::Stuck, _) => Action::Stuck {
            reason: proposed.reason.clone().or(value).unwrap_or_default(),
        },
        (kind, None) => {
            return Err(SchemaViolation(format!("\"{kind}\" requires a nodeId")));
        }
    };

    Ok(Decision {
        action,
        rationale: raw
            .thought
            .or_else(|| action_description(&proposed.description))
            .unwrap_or_else(|| "Moving forward...".into()),
        plan: raw.plan.filter(|p| !p.trim().is_empty()),
        description: proposed.description,
    })
}

fn action_description(description: &Option<String>) -> Option<String> {
    description.clone().filter(|d| !d.trim().is_empty())
}

/// Models send ids and values as strings or numbers; accept both.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
