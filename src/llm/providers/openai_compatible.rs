use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser::SseAccumulator;
use crate::llm::types::{CallConfig, ChatMessage, ContentPart, LlmResponse, MessageContent};

/// Upper bound for one decision request, streamed or not.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Error bodies are cut to this many characters in error messages.
const MAX_ERROR_BODY: usize = 400;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
}

#[derive(Deserialize)]
struct ReplyChoice {
    #[serde(default)]
    message: ReplyMessage,
}

#[derive(Default, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Any chat-completions endpoint that speaks the OpenAI wire format.
pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, endpoint: String, api_key: String) -> WebClawResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            id,
            endpoint,
            api_key,
            http,
        })
    }

    async fn read_stream(&self, response: reqwest::Response) -> WebClawResult<LlmResponse> {
        let mut body = response.bytes_stream();
        let mut acc = SseAccumulator::default();
        while let Some(chunk) = body.next().await {
            if acc.feed(&chunk?) {
                break;
            }
        }
        Ok(acc.finish())
    }

    async fn read_json(&self, response: reqwest::Response) -> WebClawResult<LlmResponse> {
        let reply: ChatReply = response.json().await?;
        let message = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| WebClawError::LlmProvider(format!("{}: reply carried no choices", self.id)))?;
        Ok(LlmResponse {
            content: message.content.unwrap_or_default(),
            reasoning: message.reasoning_content.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> WebClawResult<LlmResponse> {
        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            stream = cfg.stream,
            messages = messages.len(),
            "sending decision request"
        );
        tracing::trace!(prompt = %redacted(&messages), "decision request");

        let request = ChatRequest {
            model: &cfg.model,
            messages: &messages,
            stream: cfg.stream,
            temperature: cfg.temperature,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(WebClawError::LlmProvider(format!("{} returned {status}: {body}", self.id)));
        }

        let reply = if cfg.stream {
            self.read_stream(response).await?
        } else {
            self.read_json(response).await?
        };
        tracing::info!(
            provider = %self.id,
            content_len = reply.content.len(),
            reasoning_len = reply.reasoning.len(),
            "decision reply received"
        );
        Ok(reply)
    }
}

/// Prompt text for trace logs, with screenshots replaced by a marker.
fn redacted(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let body = match &m.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => text.as_str(),
                        ContentPart::ImageUrl { .. } => "<screenshot>",
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            format!("[{}] {body}", m.role)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ImageUrl;

    #[test]
    fn redaction_drops_image_payloads() {
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user(vec![
                ContentPart::Text { text: "GOAL: buy milk".into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: "data:image/jpeg;base64,AAAA".into() },
                },
            ]),
        ];
        let logged = redacted(&messages);
        assert!(logged.contains("[system] rules"));
        assert!(logged.contains("GOAL: buy milk"));
        assert!(logged.contains("<screenshot>"));
        assert!(!logged.contains("AAAA"));
    }

    #[test]
    fn request_serializes_in_wire_format() {
        let messages = vec![ChatMessage::user_text("hi")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn reply_without_reasoning_parses() {
        let reply: ChatReply =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"{}"}}]}"#)
                .unwrap();
        let message = &reply.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("{}"));
        assert!(message.reasoning_content.is_none());
    }
}
