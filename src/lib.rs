// Declare the modules
pub mod api;
pub mod auth;
pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod files;
pub mod images;
pub mod models;
pub mod prompts;
pub mod registry;
pub mod routes;
pub mod sandbox;
pub mod state;
pub mod storage;
pub mod stream;
pub mod tools;
pub mod ui_stream;

use crate::api::{LLMApiProvider, OpenRouterProvider};
use crate::config::Settings;
use crate::files::FileStore;
use crate::state::AppState;
use crate::storage::StorageManager;
use crate::tools::ToolRegistry;
use anyhow::Context;
use std::sync::Arc;

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("speedchat=info")).init();

    let settings = Settings::from_env()?;
    log::info!("Starting speedchat with data dir {}", settings.data_dir.display());

    let storage = StorageManager::new(&settings.database_url).await?;
    let files = FileStore::new(settings.data_dir.join("files"), &settings.public_url).await?;

    // Create the API provider instance
    let api_provider: Arc<dyn LLMApiProvider> = Arc::new(OpenRouterProvider::new(&settings.openrouter_base_url));
    let tools = ToolRegistry::from_settings(&settings);

    let bind = settings.bind.clone();
    let state = AppState::new(storage, api_provider, files, tools, settings);
    let app = routes::router(state);

    log::info!("Listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
