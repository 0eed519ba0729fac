use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};
use crate::perception::types::{NodeRef, Snapshot, TargetLabel};

/// Lifecycle states of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl RunState {
    /// Guarded transition; anything not in the table is rejected.
    pub fn transition(self, to: RunState) -> WebClawResult<RunState> {
        use RunState::*;
        let allowed = matches!(
            (self, to),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Stopping, Failed)
        );
        if allowed {
            tracing::debug!(from = %self, to = %to, "run state transition");
            Ok(to)
        } else {
            Err(WebClawError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    text: String,
    step_by_step: bool,
}

impl Goal {
    pub fn new(text: impl Into<String>, step_by_step: bool) -> Self {
        Self {
            text: text.into(),
            step_by_step,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn step_by_step(&self) -> bool {
        self.step_by_step
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Inbound control signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    GoalReceived(Goal),
    Resume,
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Hover,
    Type,
    Scroll,
    Wait,
    Navigate,
    Press,
    Done,
    Stuck,
}

impl ActionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" => Some(ActionKind::Click),
            "hover" => Some(ActionKind::Hover),
            "type" => Some(ActionKind::Type),
            "scroll" => Some(ActionKind::Scroll),
            "wait" => Some(ActionKind::Wait),
            "navigate" | "goto" => Some(ActionKind::Navigate),
            "press" => Some(ActionKind::Press),
            "done" | "finish" => Some(ActionKind::Done),
            "stuck" | "fail" => Some(ActionKind::Stuck),
            _ => None,
        }
    }

    pub fn needs_target(self) -> bool {
        matches!(
            self,
            ActionKind::Click | ActionKind::Hover | ActionKind::Type | ActionKind::Scroll
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Click => "click",
            ActionKind::Hover => "hover",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::Navigate => "navigate",
            ActionKind::Press => "press",
            ActionKind::Done => "done",
            ActionKind::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// What to do, with every required operand present.
#[derive(Debug, PartialEq)]
pub enum Action {
    Click { target: NodeRef },
    Hover { target: NodeRef },
    Type { target: NodeRef, text: String },
    Scroll { target: NodeRef, direction: ScrollDirection },
    Wait { milliseconds: u64 },
    Navigate { url: String },
    Press { key: String },
    Done { summary: String },
    Stuck { reason: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Hover { .. } => ActionKind::Hover,
            Action::Type { .. } => ActionKind::Type,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Press { .. } => ActionKind::Press,
            Action::Done { .. } => ActionKind::Done,
            Action::Stuck { .. } => ActionKind::Stuck,
        }
    }

    pub fn target(&self) -> Option<&NodeRef> {
        match self {
            Action::Click { target }
            | Action::Hover { target }
            | Action::Type { target, .. }
            | Action::Scroll { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<String> {
        match self {
            Action::Type { text, .. } => Some(text.clone()),
            Action::Scroll { direction, .. } => Some(format!("{direction:?}").to_lowercase()),
            Action::Wait { milliseconds } => Some(milliseconds.to_string()),
            Action::Navigate { url } => Some(url.clone()),
            Action::Press { key } => Some(key.clone()),
            Action::Done { summary } => Some(summary.clone()),
            Action::Stuck { reason } => Some(reason.clone()),
            Action::Click { .. } | Action::Hover { .. } => None,
        }
    }
}

/// One validated decision. Consumed once by the executor, then folded into
/// history as a [`DecisionRecord`]; deliberately not `Clone`.
#[derive(Debug)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
    pub plan: Option<String>,
    pub description: Option<String>,
}

impl Decision {
    /// Semantic identity used by loop protection: kind plus target role/name.
    pub fn key(&self, snapshot: &Snapshot) -> DecisionKey {
        DecisionKey {
            kind: self.action.kind(),
            target: self
                .action
                .target()
                .and_then(|t| snapshot.node(t))
                .map(TargetLabel::from),
        }
    }

    pub fn describe(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Executing {}", self.action.kind()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionKey {
    pub kind: ActionKind,
    pub target: Option<TargetLabel>,
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "{} {}", self.kind, t),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// History-safe form of a decision: carries role/name, never a node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub kind: ActionKind,
    pub target: Option<TargetLabel>,
    pub value: Option<String>,
    pub rationale: String,
}

impl DecisionRecord {
    pub fn from_decision(decision: Decision, snapshot: &Snapshot) -> Self {
        let key = decision.key(snapshot);
        Self {
            kind: key.kind,
            target: key.target,
            value: decision.action.value(),
            rationale: decision.rationale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Timeout,
    ElementNotFound { detail: String },
    NavigationError { message: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Timeout => f.write_str("timeout waiting for page to settle"),
            Outcome::ElementNotFound { detail } => write!(f, "element not found ({detail})"),
            Outcome::NavigationError { message } => write!(f, "navigation error ({message})"),
        }
    }
}
