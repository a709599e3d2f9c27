use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::{decode_data_url, ImageRequest};
use crate::auth::authenticate;
use crate::config::resolve_api_key;
use crate::error::{ApiError, ApiResult};
use crate::models::{GenerationStatus, ImageGeneration};
use crate::registry;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

pub async fn list_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ImageGeneration>>> {
    let user = authenticate(&headers, &state).await?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
    Ok(Json(state.storage.list_generations(&user.id, limit).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGenerationRequest {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
    pub reference_image_url: Option<String>,
}

/// Records a pending generation and processes it in the background.
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateGenerationRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let user = authenticate(&headers, &state).await?;
    let api_key = resolve_api_key(&headers, &state.settings)?;

    if body.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt cannot be empty"));
    }
    if !registry::is_image_model(&body.model) {
        return Err(ApiError::bad_request(format!("Unknown image model: {}", body.model)));
    }
    if body.id.trim().is_empty() {
        return Err(ApiError::bad_request("Invalid or duplicate generation id"));
    }

    let now = Utc::now();
    let generation = ImageGeneration {
        id: body.id.clone(),
        user_id: user.id.clone(),
        prompt: body.prompt,
        model: body.model,
        aspect_ratio: body.aspect_ratio,
        image_size: body.image_size,
        reference_image_url: body.reference_image_url,
        status: GenerationStatus::Pending,
        result_image_url: None,
        result_storage_id: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    state.storage.create_generation(&generation).await?;
    log::info!("Queued image generation {} with model {}", generation.id, generation.model);

    let task_state = state.clone();
    let id = generation.id.clone();
    tokio::spawn(async move {
        process_generation(&task_state, &id, &api_key).await;
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "id": body.id }))))
}

/// pending -> processing -> completed | failed. Never returns an error; the
/// outcome is written to the generation record.
pub async fn process_generation(state: &AppState, id: &str, api_key: &str) {
    if let Err(e) = state
        .storage
        .update_generation_status(id, GenerationStatus::Processing)
        .await
    {
        log::error!("Failed to mark generation {} as processing: {:#}", id, e);
        return;
    }

    match run_generation(state, id, api_key).await {
        Ok(url) => log::info!("Image generation {} completed: {}", id, url),
        Err(e) => {
            log::warn!("Image generation {} failed: {:#}", id, e);
            if let Err(e) = state.storage.fail_generation(id, &e.to_string()).await {
                log::error!("Failed to record failure of generation {}: {:#}", id, e);
            }
        }
    }
}

async fn run_generation(state: &AppState, id: &str, api_key: &str) -> anyhow::Result<String> {
    let generation = state
        .storage
        .get_generation(id)
        .await?
        .context("Generation not found")?;

    let data_url = state
        .api_provider
        .generate_image(
            api_key,
            ImageRequest {
                model: generation.model,
                prompt: generation.prompt,
                aspect_ratio: generation.aspect_ratio,
                image_size: generation.image_size,
                reference_image_url: generation.reference_image_url,
            },
        )
        .await?;

    let (media_type, bytes) = decode_data_url(&data_url)?;
    let media_type = if media_type.starts_with("image/") {
        media_type
    } else {
        "image/png".to_string()
    };
    let stored = state.files.put(&bytes, &media_type).await?;
    if let Err(e) = state
        .storage
        .complete_generation(id, &stored.url, &stored.storage_id)
        .await
    {
        state.files.delete_many(std::slice::from_ref(&stored.storage_id)).await;
        return Err(e);
    }
    Ok(stored.url)
}

pub async fn delete_generation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&headers, &state).await?;
    if let Some(storage_id) = state.storage.delete_generation(&id, &user.id).await? {
        state.files.delete_many(&[storage_id]).await;
    }
    Ok(StatusCode::NO_CONTENT)
}
