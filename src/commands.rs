use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{authenticate, authenticate_optional};
use crate::error::{ApiError, ApiResult};
use crate::files::validate_upload;
use crate::models::{Attachment, Chat, ChatConfig, DraftMessageEntry, SharedChat, UiMessage};
use crate::registry::{self, Model};
use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_models() -> Json<&'static [Model]> {
    Json(registry::available_models())
}

// --- Chat Commands ---

pub async fn list_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Vec<Chat>>> {
    let user = authenticate(&headers, &state).await?;
    log::info!("Listing chats for user {}", user.id);
    Ok(Json(state.storage.list_chats(&user.id).await?))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn search_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Chat>>> {
    let user = authenticate(&headers, &state).await?;
    if query.q.trim().is_empty() {
        return Ok(Json(state.storage.list_chats(&user.id).await?));
    }
    Ok(Json(state.storage.search_chats(&user.id, &query.q).await?))
}

pub async fn get_chat_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<UiMessage>>> {
    let user = authenticate(&headers, &state).await?;
    log::info!("Fetching messages for chat {}", chat_id);
    Ok(Json(state.storage.get_chat_messages(&chat_id, &user.id).await?))
}

pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    let released = state.storage.delete_chat(&chat_id, &user.id).await?;
    state.files.delete_many(&released).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_all_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    let released = state.storage.delete_all_chats(&user.id).await?;
    state.files.delete_many(&released).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_share(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = authenticate(&headers, &state).await?;
    let is_shared = state.storage.toggle_chat_share(&chat_id, &user.id).await?;
    Ok(Json(json!({ "isShared": is_shared })))
}

pub async fn get_shared_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<SharedChat>> {
    let viewer = authenticate_optional(&headers, &state).await?;
    let shared = state
        .storage
        .get_shared_chat(&chat_id, viewer.as_ref().map(|u| u.id.as_str()))
        .await?;
    Ok(Json(shared))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRequest {
    pub message_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIdResponse {
    pub chat_id: String,
}

pub async fn branch_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<BranchRequest>,
) -> ApiResult<(StatusCode, Json<ChatIdResponse>)> {
    let user = authenticate(&headers, &state).await?;
    let new_id = state
        .storage
        .branch_off_from_message(&chat_id, &body.message_id, &user.id)
        .await?;
    Ok((StatusCode::CREATED, Json(ChatIdResponse { chat_id: new_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkRequest {
    pub new_chat_id: String,
}

pub async fn fork_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<ForkRequest>,
) -> ApiResult<(StatusCode, Json<ChatIdResponse>)> {
    let user = authenticate(&headers, &state).await?;
    if body.new_chat_id.trim().is_empty() {
        return Err(ApiError::bad_request("newChatId cannot be empty"));
    }
    state.storage.fork_chat(&chat_id, &body.new_chat_id, &user.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ChatIdResponse {
            chat_id: body.new_chat_id,
        }),
    ))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

pub async fn rename_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    state.storage.rename_chat_title(&chat_id, &user.id, &body.title).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinRequest {
    pub is_pinned: bool,
}

pub async fn pin_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<PinRequest>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    state.storage.pin_chat(&chat_id, &user.id, body.is_pinned).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Message Commands ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagesRequest {
    pub message_ids: Vec<String>,
}

pub async fn delete_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeleteMessagesRequest>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    let released = state.storage.delete_messages(&user.id, &body.message_ids).await?;
    state.files.delete_many(&released).await;
    Ok(StatusCode::NO_CONTENT)
}

// --- File Commands ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub storage_id: String,
    pub media_type: String,
    pub filename: String,
}

pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let user = authenticate(&headers, &state).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;

        validate_upload(&media_type, bytes.len())?;
        let stored = state.files.put(&bytes, &media_type).await?;
        state
            .storage
            .insert_attachment(&Attachment {
                storage_id: stored.storage_id.clone(),
                user_id: user.id.clone(),
                url: stored.url.clone(),
                media_type: media_type.clone(),
                filename: filename.clone(),
                size: bytes.len() as i64,
            })
            .await?;

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                url: stored.url,
                storage_id: stored.storage_id,
                media_type,
                filename,
            }),
        ));
    }
    Err(ApiError::bad_request("No file provided"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFilesRequest {
    pub file_urls: Vec<String>,
}

pub async fn delete_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeleteFilesRequest>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    let removed = state
        .storage
        .delete_attachments_by_url(&user.id, &body.file_urls)
        .await?;
    state.files.delete_many(&removed).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Serves a stored blob. URLs are unguessable, so no session is required
/// (they are embedded directly in rendered messages).
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(storage_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (bytes, media_type) = state.files.get(&storage_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, media_type),
            (header::CACHE_CONTROL, "private, max-age=31536000, immutable"),
        ],
        bytes,
    ))
}

// --- Config Commands ---

pub async fn get_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<ChatConfig>> {
    let user = authenticate(&headers, &state).await?;
    Ok(Json(state.storage.get_chat_config(&user.id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub selected_model: Option<Model>,
    pub draft_message_entry: Option<DraftMessageEntry>,
}

/// Merges the patch into the stored config. Nothing is written when the
/// selected model is not a registry chat model.
pub async fn patch_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<ChatConfig>> {
    let user = authenticate(&headers, &state).await?;
    let mut config = state.storage.get_chat_config(&user.id).await?;

    if let Some(model) = patch.selected_model {
        let known = registry::find_chat_model(&model.id, model.thinking)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown model: {}", model.id)))?;
        config.selected_model = known.clone();
    }
    if let Some(draft) = patch.draft_message_entry {
        config.draft_message_entry = Some(draft);
    }

    state.storage.put_chat_config(&user.id, &config).await?;
    log::debug!("Updated chat config for user {}", user.id);
    Ok(Json(config))
}

pub async fn put_draft(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(draft): Json<DraftMessageEntry>,
) -> ApiResult<Json<ChatConfig>> {
    let user = authenticate(&headers, &state).await?;
    let mut config = state.storage.get_chat_config(&user.id).await?;
    config.draft_message_entry = Some(draft);
    state.storage.put_chat_config(&user.id, &config).await?;
    Ok(Json(config))
}

pub async fn clear_draft(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<ChatConfig>> {
    let user = authenticate(&headers, &state).await?;
    let mut config = state.storage.get_chat_config(&user.id).await?;
    config.draft_message_entry = Some(DraftMessageEntry::default());
    state.storage.put_chat_config(&user.id, &config).await?;
    Ok(Json(config))
}

// --- Account ---

pub async fn delete_account(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    let blobs = state.storage.delete_account(&user.id).await?;
    state.files.delete_many(&blobs).await;
    log::warn!("Account {} deleted ({} blobs removed)", user.id, blobs.len());
    Ok(StatusCode::NO_CONTENT)
}
