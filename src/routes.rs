use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::API_KEY_HEADER;
use crate::state::AppState;
use crate::{auth, chat, commands, images};

pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(API_KEY_HEADER),
        ]);

    Router::new()
        // Health
        .route("/api/health", get(commands::health))
        // Auth
        .route("/api/auth/signup", post(auth::signup))
        .route("/api/auth/signin", post(auth::signin))
        .route("/api/auth/signout", post(auth::signout))
        .route("/api/auth/me", get(auth::me))
        // Models
        .route("/api/models", get(commands::list_models))
        // Chats
        .route("/api/chats", get(commands::list_chats).delete(commands::delete_all_chats))
        .route("/api/chats/search", get(commands::search_chats))
        .route("/api/chats/:id", delete(commands::delete_chat))
        .route("/api/chats/:id/messages", get(commands::get_chat_messages))
        .route("/api/chats/:id/share", post(commands::toggle_share))
        .route("/api/chats/:id/branch", post(commands::branch_chat))
        .route("/api/chats/:id/fork", post(commands::fork_chat))
        .route("/api/chats/:id/title", patch(commands::rename_chat))
        .route("/api/chats/:id/pin", patch(commands::pin_chat))
        .route("/api/share/:id", get(commands::get_shared_chat))
        // Messages
        .route("/api/messages/delete", post(commands::delete_messages))
        // Completion
        .route("/api/chat", post(chat::send_message))
        .route("/api/chat/:id/stream", get(chat::resume_stream))
        .route("/api/chat/:id/stop", post(chat::stop_stream))
        // Files
        .route("/api/files", post(commands::upload_file))
        .route("/api/files/delete", post(commands::delete_files))
        .route("/api/files/:id", get(commands::get_file))
        // Images
        .route("/api/images", get(images::list_generations).post(images::create_generation))
        .route("/api/images/:id", delete(images::delete_generation))
        // Config
        .route("/api/config", get(commands::get_config).patch(commands::patch_config))
        .route("/api/config/draft", put(commands::put_draft).delete(commands::clear_draft))
        // Account
        .route("/api/account", delete(commands::delete_account))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}
