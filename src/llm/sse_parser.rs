//! Server-sent-event decoding for OpenAI-compatible streaming replies.
use serde::Deserialize;

use crate::errors::{WebClawError, WebClawResult};
use crate::llm::types::LlmResponse;

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    /// Some models stream their reasoning separately.
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// One decoded `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Comment, keep-alive or a non-data field.
    Skip,
    Delta {
        content: String,
        reasoning: String,
        finished: bool,
    },
    Done,
}

pub fn parse_sse_line(line: &str) -> WebClawResult<SseLine> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(SseLine::Skip);
    };
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let frame: Frame =
        serde_json::from_str(data).map_err(|e| WebClawError::SseParsing(e.to_string()))?;
    let Some(choice) = frame.choices.into_iter().next() else {
        return Ok(SseLine::Skip);
    };
    Ok(SseLine::Delta {
        content: choice.delta.content.unwrap_or_default(),
        reasoning: choice.delta.reasoning_content.unwrap_or_default(),
        finished: choice.finish_reason.is_some(),
    })
}

/// Collects a streamed reply from raw body chunks.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks survive intact.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    pending: Vec<u8>,
    content: String,
    reasoning: String,
    done: bool,
}

impl SseAccumulator {
    /// Feeds one body chunk. Returns `true` once the stream signalled its end.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.pending.extend_from_slice(bytes);
        while !self.done {
            let Some(end) = self.pending.iter().position(|b| *b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            self.apply(line.trim());
        }
        self.done
    }

    fn apply(&mut self, line: &str) {
        match parse_sse_line(line) {
            Ok(SseLine::Skip) => {}
            Ok(SseLine::Done) => self.done = true,
            Ok(SseLine::Delta { content, reasoning, finished }) => {
                self.content.push_str(&content);
                self.reasoning.push_str(&reasoning);
                self.done = finished;
            }
            Err(e) => tracing::debug!(error = %e, "SSE line skipped"),
        }
    }

    /// The reply so far, including a trailing line without a newline.
    pub fn finish(mut self) -> LlmResponse {
        if !self.done && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.apply(String::from_utf8_lossy(&rest).trim());
        }
        LlmResponse {
            content: self.content,
            reasoning: self.reasoning,
        }
    }
}
