use async_trait::async_trait;

use crate::errors::WebClawResult;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};

/// Unified reasoning-backend trait. All providers implement this trait.
/// The backend is treated as stateless: every call carries the full context.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider's identifier (matches config.toml key).
    fn name(&self) -> &str;

    /// Sends one chat completion request and returns the accumulated reply.
    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> WebClawResult<LlmResponse>;
}
