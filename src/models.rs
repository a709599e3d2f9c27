use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::Model;

// Represents a registered account
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    pub is_branch: bool,
    pub is_pinned: bool,
    pub is_shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_stream_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub model_id: String,
    #[serde(default)]
    pub used_thinking: bool,
}

/// A file attached to a message, as the client sees it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub url: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Keys this server does not read (`providerMetadata`, ...), kept as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KnownPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    File(FilePart),
    StepStart,
}

/// One part of a UI message. Parts this server does not interpret (tool
/// invocations, sources, custom data) are kept verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessagePart {
    Known(KnownPart),
    Other(Value),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Known(KnownPart::Text {
            text: text.into(),
            state: Some("done".to_string()),
            extra: Map::new(),
        })
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        MessagePart::Known(KnownPart::Reasoning {
            text: text.into(),
            state: Some("done".to_string()),
            extra: Map::new(),
        })
    }

    pub fn file(file: FilePart) -> Self {
        MessagePart::Known(KnownPart::File(file))
    }

    pub fn step_start() -> Self {
        MessagePart::Known(KnownPart::StepStart)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Known(KnownPart::Text { text, .. }) => Some(text),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FilePart> {
        match self {
            MessagePart::Known(KnownPart::File(file)) => Some(file),
            _ => None,
        }
    }
}

/// A chat message in the shape the web client renders.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl UiMessage {
    /// Text parts joined with a space; stored alongside the message for search.
    pub fn text_part(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.as_text().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn file_parts(&self) -> impl Iterator<Item = &FilePart> {
        self.parts.iter().filter_map(MessagePart::as_file)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub storage_id: String,
    pub user_id: String,
    pub url: String,
    pub media_type: String,
    pub filename: String,
    pub size: i64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Processing => "processing",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GenerationStatus::Pending),
            "processing" => Some(GenerationStatus::Processing),
            "completed" => Some(GenerationStatus::Completed),
            "failed" => Some(GenerationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageGeneration {
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_image_url: Option<String>,
    pub status: GenerationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_storage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DraftMessageEntry {
    pub message: String,
    #[serde(default)]
    pub files: Vec<FilePart>,
}

/// Per-user composer state: last used model and the unsent draft.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    pub selected_model: Model,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_message_entry: Option<DraftMessageEntry>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            selected_model: crate::registry::default_model().clone(),
            draft_message_entry: Some(DraftMessageEntry::default()),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedChatData {
    pub id: String,
    pub title: String,
    pub is_owner: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedChat {
    pub chat_data: SharedChatData,
    pub messages: Vec<UiMessage>,
}

/// Random alphanumeric id, optionally prefixed (`assistant-Ab12...`).
pub fn generate_id(prefix: Option<&str>, size: usize) -> String {
    let body: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect();
    match prefix {
        Some(p) => format!("{}-{}", p, body),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_round_trip_known_and_unknown_types() {
        let raw = json!({
            "id": "m1",
            "role": "assistant",
            "metadata": { "modelId": "openai/gpt-5.2", "usedThinking": true },
            "parts": [
                { "type": "step-start" },
                { "type": "reasoning", "text": "hmm", "state": "done" },
                { "type": "text", "text": "hello" },
                { "type": "tool-webSearch", "toolCallId": "c1", "state": "output-available", "input": {"query": "x"}, "output": []},
                { "type": "file", "url": "http://x/a.png", "mediaType": "image/png", "filename": "a.png" }
            ]
        });
        let message: UiMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.parts.len(), 5);
        assert!(matches!(message.parts[0], MessagePart::Known(KnownPart::StepStart)));
        assert!(matches!(message.parts[3], MessagePart::Other(_)));
        assert_eq!(message.file_parts().count(), 1);
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn parts_keep_provider_metadata() {
        let raw = json!({
            "id": "m2",
            "role": "assistant",
            "parts": [
                { "type": "text", "text": "hi", "providerMetadata": { "openrouter": { "reasoning_details": [] } } },
                { "type": "reasoning", "text": "think", "state": "done", "providerMetadata": { "anthropic": { "signature": "sig" } } },
                { "type": "file", "url": "http://x/b.png", "mediaType": "image/png", "providerMetadata": { "openai": { "id": 7 } } }
            ]
        });
        let message: UiMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.parts[0].as_text(), Some("hi"));
        let file = message.file_parts().next().unwrap();
        assert_eq!(file.media_type, "image/png");
        assert_eq!(file.extra["providerMetadata"]["openai"]["id"], json!(7));
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn text_part_joins_text_with_spaces() {
        let message = UiMessage {
            id: "m".into(),
            role: Role::User,
            metadata: None,
            parts: vec![
                MessagePart::text("first"),
                MessagePart::file(FilePart {
                    url: "u".into(),
                    media_type: "application/pdf".into(),
                    filename: None,
                    extra: Map::new(),
                }),
                MessagePart::text("second"),
            ],
        };
        assert_eq!(message.text_part(), "first  second");
    }

    #[test]
    fn generate_id_uses_prefix_and_size() {
        let id = generate_id(Some("assistant"), 16);
        assert!(id.starts_with("assistant-"));
        assert_eq!(id.len(), "assistant-".len() + 16);
        assert_eq!(generate_id(None, 8).len(), 8);
    }

    #[test]
    fn chat_serializes_camel_case_millis() {
        let chat = Chat {
            id: "c".into(),
            user_id: "u".into(),
            title: "New Chat".into(),
            created_at: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            updated_at: DateTime::from_timestamp_millis(1_700_000_000_456).unwrap(),
            is_branch: false,
            is_pinned: true,
            is_shared: false,
            parent_chat_id: None,
            active_stream_id: None,
        };
        let v = serde_json::to_value(&chat).unwrap();
        assert_eq!(v["createdAt"], json!(1_700_000_000_123i64));
        assert_eq!(v["isPinned"], json!(true));
        assert!(v.get("parentChatId").is_none());
    }
}
