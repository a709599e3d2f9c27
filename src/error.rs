use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;

// Marker errors raised from the storage and service layers. They travel inside
// `anyhow::Error` and are recovered by `ApiError::from` through downcasting.

#[derive(Debug)]
pub struct NotFound(pub String);

#[derive(Debug)]
pub struct Forbidden(pub String);

#[derive(Debug)]
pub struct BadRequest(pub String);

#[derive(Debug)]
pub struct Unauthorized(pub String);

macro_rules! marker_error {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl std::error::Error for $ty {}
        )*
    };
}

marker_error!(NotFound, Forbidden, BadRequest, Unauthorized);

pub fn not_found(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(NotFound(message.into()))
}

pub fn forbidden(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Forbidden(message.into()))
}

pub fn bad_request(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(BadRequest(message.into()))
}

pub fn unauthorized(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Unauthorized(message.into()))
}

/// Error returned by every HTTP handler. Serialized as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authenticated")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<NotFound>() {
            return Self::new(StatusCode::NOT_FOUND, e.0.clone());
        }
        if let Some(e) = err.downcast_ref::<Forbidden>() {
            return Self::new(StatusCode::FORBIDDEN, e.0.clone());
        }
        if let Some(e) = err.downcast_ref::<BadRequest>() {
            return Self::new(StatusCode::BAD_REQUEST, e.0.clone());
        }
        if let Some(e) = err.downcast_ref::<Unauthorized>() {
            return Self::new(StatusCode::UNAUTHORIZED, e.0.clone());
        }
        log::error!("Internal error: {:?}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn markers_survive_added_context() {
        let err: anyhow::Error = Err::<(), _>(not_found("Chat abc not found"))
            .context("while loading messages")
            .unwrap_err();
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.message, "Chat abc not found");
    }

    #[test]
    fn plain_errors_become_internal() {
        let api = ApiError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn forbidden_and_bad_request_map_to_their_statuses() {
        assert_eq!(ApiError::from(forbidden("no")).status, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(bad_request("bad")).status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(unauthorized("who")).status, StatusCode::UNAUTHORIZED);
    }
}
