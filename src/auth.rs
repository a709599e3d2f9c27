use anyhow::anyhow;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use chrono::Duration;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{unauthorized, ApiError, ApiResult};
use crate::models::User;
use crate::state::AppState;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct SigninRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: User,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Failed to hash password: {}", e))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            log::error!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extract and authenticate the user from the `Authorization: Bearer` header.
pub async fn authenticate(headers: &HeaderMap, state: &AppState) -> ApiResult<User> {
    authenticate_optional(headers, state)
        .await?
        .ok_or_else(ApiError::unauthorized)
}

/// Like `authenticate`, but anonymous callers get `None` instead of a 401.
pub async fn authenticate_optional(headers: &HeaderMap, state: &AppState) -> ApiResult<Option<User>> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    Ok(state.storage.user_for_session(token).await?)
}

pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    if !body.email.contains('@') {
        return Err(ApiError::bad_request("A valid email is required"));
    }
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Name cannot be empty"));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let hash = hash_password(&body.password)?;
    let user = state.storage.create_user(&body.email, &body.name, &hash).await?;
    let token = state
        .storage
        .create_session(&user.id, Duration::days(state.settings.session_ttl_days))
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse { token, user })))
}

pub async fn signin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SigninRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let Some((user, hash)) = state.storage.find_user_credentials(&body.email).await? else {
        log::info!("Sign-in attempt for unknown email");
        return Err(unauthorized("Invalid email or password").into());
    };
    if !verify_password(&body.password, &hash) {
        log::info!("Failed sign-in for user {}", user.id);
        return Err(unauthorized("Invalid email or password").into());
    }
    let token = state
        .storage
        .create_session(&user.id, Duration::days(state.settings.session_ttl_days))
        .await?;
    log::info!("User {} signed in", user.id);
    Ok(Json(SessionResponse { token, user }))
}

pub async fn signout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    if let Some(token) = bearer_token(&headers) {
        state.storage.delete_session(token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<User>> {
    Ok(Json(authenticate(&headers, &state).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer tok123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok123"));
    }
}
