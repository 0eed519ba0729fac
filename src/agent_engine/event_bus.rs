use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::agent_engine::state::AgentEvent;

pub const GOAL_ACHIEVED: &str = "Goal Achieved!";
pub const EXECUTION_INTERRUPTED: &str = "Execution Interrupted.";

/// Messages pushed to whatever UI/transport is listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    State {
        screenshot: String,
        url: String,
        events: Vec<String>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
    Protocol {
        message: String,
    },
    Success {
        message: String,
    },
    Thought {
        model: String,
        thought: String,
    },
    Pause {
        message: String,
        rationale: String,
    },
    Report {
        location: String,
    },
}

impl OutboundEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            OutboundEvent::Success { message } => message == GOAL_ACHIEVED,
            OutboundEvent::Error { .. } => true,
            _ => false,
        }
    }
}

/// Outbound fan-out plus the inbound control channel.
pub struct EventBus {
    tx: broadcast::Sender<OutboundEvent>,
    command_tx: mpsc::Sender<AgentEvent>,
}

impl EventBus {
    /// Returns the bus and the receiver the engine consumes commands from.
    pub fn new() -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(32);
        (Self { tx, command_tx }, command_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    pub fn emitter(&self) -> Emitter {
        Emitter {
            tx: self.tx.clone(),
        }
    }

    pub fn command_sender(&self) -> mpsc::Sender<AgentEvent> {
        self.command_tx.clone()
    }
}

/// Cheap handle the engine uses to publish events.
#[derive(Clone)]
pub struct Emitter {
    tx: broadcast::Sender<OutboundEvent>,
}

impl Emitter {
    pub fn emit(&self, event: OutboundEvent) {
        // No subscribers is not an error: the run proceeds unobserved.
        if self.tx.send(event).is_err() {
            tracing::trace!("outbound event dropped: no subscribers");
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(OutboundEvent::Log {
            message: message.into(),
        });
    }

    pub fn protocol(&self, message: impl Into<String>) {
        self.emit(OutboundEvent::Protocol {
            message: message.into(),
        });
    }
}
