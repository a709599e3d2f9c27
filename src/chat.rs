use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Local;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::{to_provider_messages, ChatMessage, CompletionRequest, ReasoningConfig, StreamDelta, ToolCall};
use crate::auth::authenticate;
use crate::config::resolve_api_key;
use crate::error::{ApiError, ApiResult};
use crate::files::MAX_FILES_PER_MESSAGE;
use crate::models::{generate_id, KnownPart, MessageMetadata, MessagePart, Role, UiMessage};
use crate::prompts::{chat_system_prompt, clean_title, TITLE_GEN_PROMPT};
use crate::registry::{self, Model};
use crate::state::AppState;
use crate::ui_stream::{UiStreamEvent, WordChunker, DONE, UI_STREAM_HEADER, UI_STREAM_VERSION};

pub const MAX_STEPS: usize = 5;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    chat_id: String,
    messages: Vec<UiMessage>,
    model: Model,
    #[serde(default)]
    is_new_chat: bool,
}

/// SSE response replaying `history`, then following `live` until `[DONE]`.
fn ui_stream_response(history: Vec<String>, live: Option<broadcast::Receiver<String>>) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        for line in history {
            let done = line == DONE;
            if tx.send(line).is_err() || done {
                return;
            }
        }
        if let Some(mut live) = live {
            loop {
                match live.recv().await {
                    Ok(line) => {
                        let done = line == DONE;
                        if tx.send(line).is_err() || done {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Stream subscriber lagged, skipped {} lines", n);
                        continue;
                    }
                    Err(_) => break,
                }
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    (
        [(UI_STREAM_HEADER, UI_STREAM_VERSION)],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// POST /api/chat
pub async fn send_message(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let user = authenticate(&headers, &state).await?;
    let api_key = resolve_api_key(&headers, &state.settings)?;

    let request: ChatRequest = serde_json::from_slice(&body).map_err(|e| {
        log::debug!("Rejected chat request body: {}", e);
        ApiError::bad_request("Invalid request body")
    })?;
    let model = registry::find_chat_model(&request.model.id, request.model.thinking)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown model: {}", request.model.id)))?;
    let latest = match request.messages.last() {
        Some(m) if m.role == Role::User => m.clone(),
        Some(_) => return Err(ApiError::bad_request("The last message must be a user message")),
        None => return Err(ApiError::bad_request("Messages cannot be empty")),
    };
    if latest.file_parts().count() > MAX_FILES_PER_MESSAGE {
        return Err(ApiError::bad_request(format!(
            "At most {} files can be attached to a message",
            MAX_FILES_PER_MESSAGE
        )));
    }

    let chat_id = request.chat_id;
    log::info!("Chat request for {} using model {}", chat_id, model.id);

    if request.is_new_chat {
        state.storage.create_chat(&chat_id, &user.id).await?;

        let title_state = state.clone();
        let title_key = api_key.clone();
        let title_chat = chat_id.clone();
        let title_user = user.id.clone();
        let first_message = latest.clone();
        tokio::spawn(async move {
            if let Err(e) = generate_chat_title(&title_state, &title_key, &title_chat, &title_user, &first_message).await {
                log::error!("Failed to generate chat title for {}: {:#}", title_chat, e);
            }
        });
    }

    state.storage.upsert_message(&chat_id, &user.id, &latest).await?;

    let stream_id = generate_id(None, 21);
    state.streams.start(&stream_id).await;
    state
        .storage
        .set_active_stream_id(&chat_id, &user.id, Some(&stream_id))
        .await?;
    // subscribe before the task can emit anything
    let (history, live) = state.streams.subscribe(&stream_id).await.unwrap_or_default();

    let task = GenerationTask {
        state: state.clone(),
        user_id: user.id,
        chat_id,
        stream_id,
        api_key,
        model,
        assistant_id: generate_id(Some("assistant"), 16),
    };
    tokio::spawn(task.run(request.messages));

    Ok(ui_stream_response(history, live))
}

/// GET /api/chat/:id/stream
pub async fn resume_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<Response> {
    let user = authenticate(&headers, &state).await?;
    let Some(stream_id) = state.storage.get_active_stream_id(&chat_id, &user.id).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    match state.streams.subscribe(&stream_id).await {
        Some((history, Some(live))) => {
            log::info!("Resuming stream {} for chat {}", stream_id, chat_id);
            Ok(ui_stream_response(history, Some(live)))
        }
        _ => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/chat/:id/stop
pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = authenticate(&headers, &state).await?;
    let active = state.storage.get_active_stream_id(&chat_id, &user.id).await?;
    let stopped = match active {
        Some(stream_id) => {
            state
                .streams
                .if_active(&stream_id, || {
                    log::info!("Requesting cancellation of stream {}", stream_id);
                    state.cancelled_streams.insert(stream_id.clone(), true);
                })
                .await
        }
        None => false,
    };
    Ok(Json(json!({ "stopped": stopped })))
}

/// Asks the title model for a short title and stores it. Runs detached.
pub async fn generate_chat_title(
    state: &AppState,
    api_key: &str,
    chat_id: &str,
    user_id: &str,
    message: &UiMessage,
) -> anyhow::Result<()> {
    let request = title_request(&state.settings.title_model, message);
    let raw = state.api_provider.send_chat_request(api_key, request).await?;
    let title = clean_title(&raw).context("Title model returned an empty title")?;
    state.storage.update_chat_title(chat_id, user_id, &title).await?;
    log::info!("Generated title for chat {}: {}", chat_id, title);
    Ok(())
}

/// The first user message goes to the title model whole, files included.
fn title_request(model: &str, message: &UiMessage) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        messages: to_provider_messages(TITLE_GEN_PROMPT, std::slice::from_ref(message)),
        tools: Vec::new(),
        reasoning: None,
    }
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

enum StepOutcome {
    Finished(Option<String>),
    ToolCalls { text: String, calls: Vec<ToolCall> },
    Cancelled,
}

/// Open text/reasoning blocks of the current step.
struct StepBuffers {
    step: usize,
    chunker: WordChunker,
    text: String,
    reasoning: String,
    text_open: bool,
    reasoning_open: bool,
}

impl StepBuffers {
    fn new(step: usize) -> Self {
        Self {
            step,
            chunker: WordChunker::new(),
            text: String::new(),
            reasoning: String::new(),
            text_open: false,
            reasoning_open: false,
        }
    }

    fn text_id(&self) -> String {
        format!("text-{}", self.step)
    }

    fn reasoning_id(&self) -> String {
        format!("reasoning-{}", self.step)
    }
}

struct GenerationTask {
    state: Arc<AppState>,
    user_id: String,
    chat_id: String,
    stream_id: String,
    api_key: String,
    model: &'static Model,
    assistant_id: String,
}

impl GenerationTask {
    async fn emit(&self, event: UiStreamEvent) {
        self.state.streams.push(&self.stream_id, event.to_line()).await;
    }

    fn is_cancelled(&self) -> bool {
        self.state.cancelled_streams.contains_key(&self.stream_id)
    }

    fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            model_id: self.model.id.clone(),
            used_thinking: self.model.thinking,
        }
    }

    async fn run(self, history: Vec<UiMessage>) {
        log::info!("Generation started for chat {} (stream {})", self.chat_id, self.stream_id);
        let metadata = serde_json::to_value(self.metadata()).ok();
        self.emit(UiStreamEvent::Start {
            message_id: self.assistant_id.clone(),
            message_metadata: metadata.clone(),
        })
        .await;

        let system = chat_system_prompt(&self.model.name, Local::now());
        let mut conversation = to_provider_messages(&system, &history);
        let mut parts: Vec<MessagePart> = Vec::new();
        let mut finish_reason = None;
        let mut cancelled = false;
        let mut failure = None;

        for step in 0..MAX_STEPS {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            self.emit(UiStreamEvent::StartStep).await;
            parts.push(MessagePart::step_start());

            let mut buffers = StepBuffers::new(step);
            let outcome = self.stream_step(&conversation, &mut buffers).await;
            self.close_blocks(&mut buffers, &mut parts).await;

            match outcome {
                Ok(StepOutcome::Finished(reason)) => {
                    self.emit(UiStreamEvent::FinishStep).await;
                    finish_reason = reason;
                    break;
                }
                Ok(StepOutcome::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Ok(StepOutcome::ToolCalls { text, calls }) => {
                    let results = self.run_tools(&calls, &mut parts).await;
                    self.emit(UiStreamEvent::FinishStep).await;
                    conversation.push(ChatMessage::assistant_tool_calls(text, calls));
                    for (call_id, output) in results {
                        conversation.push(ChatMessage::tool_result(&call_id, &output));
                    }
                    finish_reason = Some("tool-calls".to_string());
                }
                Err(e) => {
                    log::error!("Generation failed for chat {}: {:#}", self.chat_id, e);
                    failure = Some(format!("{:#}", e));
                    break;
                }
            }
        }

        if cancelled {
            log::info!("Generation cancelled for chat {}", self.chat_id);
            self.emit(UiStreamEvent::Abort).await;
        } else {
            if let Some(error_text) = failure {
                self.emit(UiStreamEvent::Error { error_text }).await;
                finish_reason = Some("error".to_string());
            }
            self.emit(UiStreamEvent::Finish {
                finish_reason,
                message_metadata: metadata,
            })
            .await;
        }

        self.persist(parts).await;
        self.finish_stream().await;
    }

    /// Streams one provider call into `buffers`. Returns when the provider
    /// finishes, the stream is cancelled, or a delta fails.
    async fn stream_step(&self, conversation: &[ChatMessage], buffers: &mut StepBuffers) -> anyhow::Result<StepOutcome> {
        let request = CompletionRequest {
            model: self.model.id.clone(),
            messages: conversation.to_vec(),
            tools: self.state.tools.definitions(),
            reasoning: Some(ReasoningConfig::medium(self.model.thinking)),
        };
        let mut deltas = self
            .state
            .api_provider
            .send_chat_stream_request(&self.api_key, request)
            .await?;

        let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
        let mut finish_reason = None;

        while let Some(delta) = deltas.next().await {
            // >>> Check for cancellation request <<<
            if self.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            match delta? {
                StreamDelta::Reasoning(chunk) => {
                    if !buffers.reasoning_open {
                        buffers.reasoning_open = true;
                        self.emit(UiStreamEvent::ReasoningStart { id: buffers.reasoning_id() }).await;
                    }
                    buffers.reasoning.push_str(&chunk);
                    self.emit(UiStreamEvent::ReasoningDelta {
                        id: buffers.reasoning_id(),
                        delta: chunk,
                    })
                    .await;
                }
                StreamDelta::Text(chunk) => {
                    if buffers.reasoning_open {
                        buffers.reasoning_open = false;
                        self.emit(UiStreamEvent::ReasoningEnd { id: buffers.reasoning_id() }).await;
                    }
                    if !buffers.text_open {
                        buffers.text_open = true;
                        self.emit(UiStreamEvent::TextStart { id: buffers.text_id() }).await;
                    }
                    buffers.text.push_str(&chunk);
                    for word in buffers.chunker.push(&chunk) {
                        self.emit(UiStreamEvent::TextDelta {
                            id: buffers.text_id(),
                            delta: word,
                        })
                        .await;
                    }
                }
                StreamDelta::ToolCall { index, id, name, arguments } => {
                    let call = pending.entry(index).or_default();
                    if id.is_some() {
                        call.id = id;
                    }
                    if let Some(name) = name {
                        call.name.push_str(&name);
                    }
                    call.arguments.push_str(&arguments);
                }
                StreamDelta::Finish(reason) => {
                    log::debug!("Step {} finished: {}", buffers.step, reason);
                    finish_reason = Some(reason);
                }
            }
        }

        if pending.is_empty() {
            return Ok(StepOutcome::Finished(finish_reason));
        }
        let calls = pending
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let id = c.id.unwrap_or_else(|| generate_id(Some("call"), 16));
                ToolCall::function(id, c.name, c.arguments)
            })
            .collect();
        Ok(StepOutcome::ToolCalls {
            text: buffers.text.clone(),
            calls,
        })
    }

    /// Closes any open blocks and records them as message parts.
    async fn close_blocks(&self, buffers: &mut StepBuffers, parts: &mut Vec<MessagePart>) {
        if buffers.reasoning_open {
            buffers.reasoning_open = false;
            self.emit(UiStreamEvent::ReasoningEnd { id: buffers.reasoning_id() }).await;
        }
        if buffers.text_open {
            if let Some(rest) = buffers.chunker.flush() {
                self.emit(UiStreamEvent::TextDelta {
                    id: buffers.text_id(),
                    delta: rest,
                })
                .await;
            }
            buffers.text_open = false;
            self.emit(UiStreamEvent::TextEnd { id: buffers.text_id() }).await;
        }
        if !buffers.reasoning.is_empty() {
            parts.push(MessagePart::reasoning(buffers.reasoning.clone()));
        }
        if !buffers.text.is_empty() {
            parts.push(MessagePart::text(buffers.text.clone()));
        }
    }

    async fn run_tools(&self, calls: &[ToolCall], parts: &mut Vec<MessagePart>) -> Vec<(String, Value)> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let input: Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                    log::warn!("Tool call {} had invalid arguments: {}", call.id, e);
                    Value::String(call.function.arguments.clone())
                })
            };
            self.emit(UiStreamEvent::ToolInputAvailable {
                tool_call_id: call.id.clone(),
                tool_name: call.function.name.clone(),
                input: input.clone(),
            })
            .await;

            let output = self.state.tools.execute(&call.function.name, input.clone()).await;

            self.emit(UiStreamEvent::ToolOutputAvailable {
                tool_call_id: call.id.clone(),
                output: output.clone(),
            })
            .await;
            parts.push(MessagePart::Other(json!({
                "type": format!("tool-{}", call.function.name),
                "toolCallId": call.id,
                "state": "output-available",
                "input": input,
                "output": output,
            })));
            results.push((call.id.clone(), output));
        }
        results
    }

    /// Saves whatever was produced, including partial output after a stop or error.
    async fn persist(&self, parts: Vec<MessagePart>) {
        let has_content = parts
            .iter()
            .any(|p| !matches!(p, MessagePart::Known(KnownPart::StepStart)));
        if !has_content {
            log::info!("No assistant content produced for chat {}, nothing to save", self.chat_id);
            return;
        }
        let message = UiMessage {
            id: self.assistant_id.clone(),
            role: Role::Assistant,
            metadata: Some(self.metadata()),
            parts,
        };
        match self.state.storage.upsert_message(&self.chat_id, &self.user_id, &message).await {
            Ok(()) => log::info!("Saved assistant message {} for chat {}", message.id, self.chat_id),
            Err(e) => log::error!("Failed to save assistant message for chat {}: {:#}", self.chat_id, e),
        }
    }

    async fn finish_stream(&self) {
        if let Err(e) = self
            .state
            .storage
            .set_active_stream_id(&self.chat_id, &self.user_id, None)
            .await
        {
            // the chat may have been deleted mid-stream
            log::warn!("Failed to clear active stream for chat {}: {:#}", self.chat_id, e);
        }
        self.state.streams.end(&self.stream_id).await;
        self.state.streams.remove(&self.stream_id).await;
        self.state.cancelled_streams.remove(&self.stream_id); // Clean up the flag
        log::info!("Generation finished for chat {} (stream {})", self.chat_id, self.stream_id);
    }
}
