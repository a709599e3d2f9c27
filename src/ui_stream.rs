//! Server side of the AI SDK "UI message stream" SSE format.
//!
//! Each SSE `data:` line is one JSON event tagged by `type`; the stream is
//! terminated by a literal `[DONE]` line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_STREAM_VERSION: &str = "v1";
pub const DONE: &str = "[DONE]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiStreamEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "messageMetadata", skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    FinishStep,
    Finish {
        #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(rename = "messageMetadata", skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    Abort,
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

impl UiStreamEvent {
    /// JSON payload for one SSE `data:` line.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize stream event: {}", e);
                r#"{"type":"error","errorText":"Failed to serialize stream event"}"#.to_string()
            }
        }
    }
}

/// Re-chunks text deltas so the client receives whole words.
///
/// A chunk is any leading whitespace, one word, and the whitespace after it.
/// Text without trailing whitespace stays buffered until more arrives or
/// `flush` is called.
#[derive(Debug, Default)]
pub struct WordChunker {
    buffer: String,
}

impl WordChunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut chunks = Vec::new();
        while let Some(end) = self.next_boundary() {
            chunks.push(self.buffer.drain(..end).collect());
        }
        chunks
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    fn next_boundary(&self) -> Option<usize> {
        let word_start = self.buffer.find(|c: char| !c.is_whitespace())?;
        let word_end = word_start + self.buffer[word_start..].find(char::is_whitespace)?;
        let next_word = self.buffer[word_end..]
            .find(|c: char| !c.is_whitespace())
            .map(|i| word_end + i)
            .unwrap_or(self.buffer.len());
        Some(next_word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_ai_sdk_field_names() {
        let start = UiStreamEvent::Start {
            message_id: "assistant-1".into(),
            message_metadata: Some(json!({"modelId": "openai/gpt-5.2"})),
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({"type": "start", "messageId": "assistant-1", "messageMetadata": {"modelId": "openai/gpt-5.2"}})
        );
        let tool = UiStreamEvent::ToolInputAvailable {
            tool_call_id: "call_1".into(),
            tool_name: "webSearch".into(),
            input: json!({"query": "rust"}),
        };
        assert_eq!(
            tool.to_line(),
            r#"{"type":"tool-input-available","toolCallId":"call_1","toolName":"webSearch","input":{"query":"rust"}}"#
        );
        assert_eq!(UiStreamEvent::StartStep.to_line(), r#"{"type":"start-step"}"#);
        assert_eq!(
            UiStreamEvent::Error { error_text: "boom".into() }.to_line(),
            r#"{"type":"error","errorText":"boom"}"#
        );
        assert_eq!(
            UiStreamEvent::Finish { finish_reason: None, message_metadata: None }.to_line(),
            r#"{"type":"finish"}"#
        );
    }

    #[test]
    fn chunker_emits_whole_words() {
        let mut chunker = WordChunker::new();
        assert!(chunker.push("Hel").is_empty());
        assert_eq!(chunker.push("lo wor"), vec!["Hello "]);
        assert_eq!(chunker.push("ld, how  are"), vec!["world, ", "how  "]);
        assert_eq!(chunker.flush().as_deref(), Some("are"));
        assert_eq!(chunker.flush(), None);
    }

    #[test]
    fn chunker_keeps_leading_whitespace_and_newlines() {
        let mut chunker = WordChunker::new();
        assert!(chunker.push("\n\n").is_empty());
        assert_eq!(chunker.push("# Title\n"), vec!["\n\n# ", "Title\n"]);
        assert_eq!(chunker.flush(), None);
    }
}
