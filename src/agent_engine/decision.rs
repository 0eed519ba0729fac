use std::sync::Arc;

use base64::Engine as _;

use crate::agent_engine::history::RunHistory;
use crate::agent_engine::response::{self, SchemaViolation};
use crate::agent_engine::state::{Decision, Goal};
use crate::config::{AgentConfig, ExecutorConfig, PerceptionConfig};
use crate::errors::{WebClawError, WebClawResult};
use crate::llm::registry::ProviderRegistry;
use crate::llm::types::{ChatMessage, ContentPart, ImageUrl, ModelTier};
use crate::perception::ax_tree::prune_for_prompt;
use crate::perception::pipeline::critical_signals;
use crate::perception::types::Snapshot;

const SYSTEM_PROMPT: &str = include_str!("../../prompts/system.md");

/// Routing policy: the stronger tier on the first cycle, after a failed
/// outcome, and while a loop hint is pending; the faster tier otherwise.
pub fn route(cycle: u32, last_outcome_failed: bool, flagged: bool) -> ModelTier {
    if cycle <= 1 || last_outcome_failed || flagged {
        ModelTier::Reasoning
    } else {
        ModelTier::Fast
    }
}

/// A decision plus what produced it, for the thought stream.
#[derive(Debug)]
pub struct Decided {
    pub decision: Decision,
    pub model: String,
    pub tier: ModelTier,
}

pub struct DecisionEngine {
    registry: Arc<ProviderRegistry>,
    perception: PerceptionConfig,
    executor: ExecutorConfig,
    invalid_retries: u32,
}

impl DecisionEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        agent: &AgentConfig,
        perception: PerceptionConfig,
        executor: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            perception,
            executor,
            invalid_retries: agent.invalid_decision_retries,
        }
    }

    /// Asks the backend for the next step. Transport errors propagate as-is;
    /// a reply that still violates the schema after the corrective retries
    /// becomes [`WebClawError::InvalidDecision`].
    pub async fn decide(
        &self,
        goal: &Goal,
        snapshot: &Snapshot,
        history: &RunHistory,
        hint: Option<&str>,
        tier: ModelTier,
    ) -> WebClawResult<Decided> {
        let (provider, cfg) = self.registry.call_config_for_tier(tier)?;
        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            self.observation_message(goal, snapshot, history, hint),
        ];

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            tracing::info!(
                tier = tier.role_name(),
                model = %cfg.model,
                attempt = attempts,
                snapshot = %snapshot.id(),
                "requesting decision"
            );
            let reply = provider.chat(messages.clone(), &cfg).await?;
            if !reply.reasoning.is_empty() {
                tracing::debug!(reasoning_len = reply.reasoning.len(), "model reasoning received");
            }

            match response::parse_decision(&reply.content, snapshot, &self.executor) {
                Ok(decision) => {
                    tracing::info!(
                        action = %decision.action.kind(),
                        rationale = %decision.rationale,
                        "decision accepted"
                    );
                    return Ok(Decided {
                        decision,
                        model: cfg.model.clone(),
                        tier,
                    });
                }
                Err(SchemaViolation(reason)) => {
                    tracing::warn!(attempt = attempts, reason = %reason, "decision rejected");
                    if attempts > self.invalid_retries {
                        return Err(WebClawError::InvalidDecision(reason));
                    }
                    messages.push(ChatMessage::assistant(reply.content));
                    messages.push(ChatMessage::user_text(format!(
                        "Your previous reply was invalid: {reason}. \
                         Reply again with a single JSON object that follows the schema, \
                         using only nodeIds from the current node list."
                    )));
                }
            }
        }
    }

    fn observation_message(
        &self,
        goal: &Goal,
        snapshot: &Snapshot,
        history: &RunHistory,
        hint: Option<&str>,
    ) -> ChatMessage {
        let mut parts = vec![ContentPart::Text {
            text: self.observation_text(goal, snapshot, history, hint),
        }];
        if !snapshot.image.is_empty() {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&snapshot.image);
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{b64}"),
                },
            });
        }
        ChatMessage::user(parts)
    }

    pub(crate) fn observation_text(
        &self,
        goal: &Goal,
        snapshot: &Snapshot,
        history: &RunHistory,
        hint: Option<&str>,
    ) -> String {
        let mut text = format!("GOAL: {}\nCURRENT URL: {}\n", goal.text(), snapshot.url);

        let critical = critical_signals(&snapshot.events);
        if !critical.is_empty() {
            text.push_str("\nCRITICAL SIGNALS (authorization problems detected):\n");
            for event in critical {
                text.push_str(&format!("- {event}\n"));
            }
        }

        text.push_str("\nINTERACTIVE ELEMENTS:\n");
        let nodes = prune_for_prompt(&snapshot.nodes, self.perception.max_prompt_nodes);
        if nodes.is_empty() {
            text.push_str("(none)\n");
        }
        for node in nodes {
            text.push_str(&format!("[{}] {} \"{}\"", node.node_id, node.role, node.name));
            if !node.enabled {
                text.push_str(" (disabled)");
            }
            if !node.visible {
                text.push_str(" (hidden)");
            }
            text.push('\n');
        }

        let events = snapshot.event_lines();
        if !events.is_empty() {
            text.push_str("\nRECENT PAGE EVENTS:\n");
            let skip = events.len().saturating_sub(self.perception.max_prompt_events);
            for line in events.iter().skip(skip) {
                text.push_str(&format!("- {line}\n"));
            }
        }

        if !history.is_empty() {
            text.push_str("\nPREVIOUS STEPS:\n");
            for line in history.prompt_lines() {
                text.push_str(&line);
                text.push('\n');
            }
        }

        if let Some(hint) = hint {
            text.push_str(&format!("\nWARNING: {hint}\n"));
        }

        text.push_str("\nDecide the single next action.");
        text
    }
}
