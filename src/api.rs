use crate::models::{KnownPart, MessagePart, Role, UiMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

// Alias for the stream type we'll return
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    /// Tool call fragment; fragments sharing an `index` concatenate.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finish(String),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReasoningConfig {
    pub effort: String,
    pub enabled: bool,
}

impl ReasoningConfig {
    pub fn medium(enabled: bool) -> Self {
        Self {
            effort: "medium".to_string(),
            enabled,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A message in OpenAI chat-completions shape.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(text: String, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: (!text.is_empty()).then_some(MessageContent::Text(text)),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, output: &Value) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(MessageContent::Text(output.to_string())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
    pub reference_image_url: Option<String>,
}

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns a stream of content, reasoning and tool call deltas.
    async fn send_chat_stream_request(&self, api_key: &str, request: CompletionRequest) -> Result<DeltaStream>;

    /// Single non-streamed completion; returns the assistant text.
    async fn send_chat_request(&self, api_key: &str, request: CompletionRequest) -> Result<String>;

    /// Returns the generated image as a `data:` URL.
    async fn generate_image(&self, api_key: &str, request: ImageRequest) -> Result<String>;
}

/// Converts stored UI messages into provider messages, system prompt first.
/// Only text and files are forwarded; reasoning, step and tool parts are not.
pub fn to_provider_messages(system: &str, messages: &[UiMessage]) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::text("system", system)];
    for message in messages {
        let text: String = message.parts.iter().filter_map(MessagePart::as_text).collect();

        let mut files = Vec::new();
        if message.role == Role::User {
            for part in &message.parts {
                let MessagePart::Known(KnownPart::File(file)) = part else {
                    continue;
                };
                if file.media_type.starts_with("image/") {
                    files.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url: file.url.clone() },
                    });
                } else if file.media_type == "application/pdf" {
                    files.push(ContentPart::File {
                        file: FileData {
                            filename: file.filename.clone().unwrap_or_else(|| "document.pdf".to_string()),
                            file_data: file.url.clone(),
                        },
                    });
                }
            }
        }

        if text.is_empty() && files.is_empty() {
            continue;
        }
        let content = if files.is_empty() {
            MessageContent::Text(text)
        } else {
            let mut parts = Vec::with_capacity(files.len() + 1);
            if !text.is_empty() {
                parts.push(ContentPart::Text { text });
            }
            parts.extend(files);
            MessageContent::Parts(parts)
        };
        out.push(ChatMessage {
            role: message.role.as_str().to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    out
}

/// Splits a `data:<media type>;base64,<payload>` URL into media type and bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:").context("Image is not a data URL")?;
    let (header, payload) = rest.split_once(',').context("Malformed data URL")?;
    let media_type = header
        .strip_suffix(";base64")
        .context("Data URL is not base64 encoded")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("Failed to decode base64 image data")?;
    Ok((media_type.to_string(), bytes))
}

// --- OpenRouter Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenRouterRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "<[ToolDefinition]>::is_empty")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<&'a ReasoningConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: ChoiceDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChoiceDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize, Debug)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

fn provider_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Extracts `error.message` from an error response body, if present.
fn error_message_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parses the data of one SSE event into zero or more deltas.
fn parse_stream_data(data: &str) -> Result<Vec<StreamDelta>> {
    let data = data.trim();

    // Check for the special [DONE] message
    if data == "[DONE]" {
        log::debug!("Stream finished with [DONE]");
        return Ok(Vec::new());
    }
    if data.is_empty() || data.starts_with(':') {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(data)
        .with_context(|| format!("Failed to parse stream chunk as JSON: {}", data))?;
    if value.get("type").and_then(Value::as_str) == Some("ping") {
        log::debug!("Received stream ping event, skipping.");
        return Ok(Vec::new());
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .with_context(|| format!("Parsed as JSON but not a valid stream chunk: {}", data))?;
    if let Some(error) = chunk.error {
        anyhow::bail!("Provider error: {}", provider_error_message(&error));
    }

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(reasoning) = choice.delta.reasoning.filter(|r| !r.is_empty()) {
            deltas.push(StreamDelta::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            deltas.push(StreamDelta::Text(content));
        }
        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match fragment.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(StreamDelta::ToolCall {
                index: fragment.index,
                id: fragment.id,
                name,
                arguments,
            });
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(StreamDelta::Finish(reason));
        }
    }
    Ok(deltas)
}

/// Finds the first generated image URL in a chat completion response.
fn extract_image_url(response: &Value) -> Option<String> {
    response
        .pointer("/choices/0/message/images/0/image_url/url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub struct OpenRouterProvider {
    client: Client,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post_json(&self, api_key: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        self.client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .header("X-Title", "speedchat")
            .json(body)
            .send()
            .await
            .context("Failed to send request to OpenRouter")
    }
}

#[async_trait]
impl LLMApiProvider for OpenRouterProvider {
    async fn send_chat_stream_request(&self, api_key: &str, request: CompletionRequest) -> Result<DeltaStream> {
        log::info!(
            "Sending STREAM request to {} using model: {} ({} messages, {} tools)",
            self.base_url,
            request.model,
            request.messages.len(),
            request.tools.len()
        );

        let body = OpenRouterRequestBody {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            tools: &request.tools,
            reasoning: request.reasoning.as_ref(),
        };
        let response = self.post_json(api_key, &body).await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("OpenRouter stream request failed with status {}: {}", status, error_body);
            let message = error_message_from_body(&error_body).unwrap_or(error_body);
            return Err(anyhow::anyhow!("API stream request failed with status {}: {}", status, message));
        }

        // Process the SSE stream
        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<Vec<StreamDelta>> {
                let event = event_result.context("Error reading stream event")?;
                parse_stream_data(&event.data)
            })
            .flat_map(|result| {
                let items: Vec<Result<StreamDelta>> = match result {
                    Ok(deltas) => deltas.into_iter().map(Ok).collect(),
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        vec![Err(e)]
                    }
                };
                stream::iter(items)
            });

        Ok(Box::pin(delta_stream))
    }

    async fn send_chat_request(&self, api_key: &str, request: CompletionRequest) -> Result<String> {
        log::debug!("Sending completion request using model: {}", request.model);
        let body = OpenRouterRequestBody {
            model: &request.model,
            messages: &request.messages,
            stream: false,
            tools: &request.tools,
            reasoning: request.reasoning.as_ref(),
        };
        let response = self.post_json(api_key, &body).await?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .context("Failed to parse completion response")?;
        if !status.is_success() {
            let message = value
                .get("error")
                .map(provider_error_message)
                .unwrap_or_else(|| status.to_string());
            anyhow::bail!("Completion request failed: {}", message);
        }
        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Completion response had no content")
    }

    async fn generate_image(&self, api_key: &str, request: ImageRequest) -> Result<String> {
        log::info!("Generating image with model {}", request.model);
        let mut content = Vec::new();
        if let Some(reference) = &request.reference_image_url {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl { url: reference.clone() },
            });
        }
        content.push(ContentPart::Text {
            text: request.prompt.clone(),
        });

        let body = serde_json::json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": content }],
            "modalities": ["image", "text"],
            "image_config": {
                "aspect_ratio": request.aspect_ratio.as_deref().unwrap_or("1:1"),
                "image_size": request.image_size.as_deref().unwrap_or("1K"),
            },
        });
        let response = self.post_json(api_key, &body).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read image generation response")?;

        if !status.is_success() {
            log::error!("Image generation failed with status {}: {}", status, text);
            let message = error_message_from_body(&text).unwrap_or_else(|| "Failed to generate image".to_string());
            anyhow::bail!(message);
        }

        let value: Value = serde_json::from_str(&text).context("Failed to parse image generation response")?;
        extract_image_url(&value).context("No image returned from API")
    }
}
