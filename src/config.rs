use anyhow::{Context, Result};
use axum::http::HeaderMap;
use std::path::PathBuf;

use crate::sandbox::SandboxMode;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub database_url: String,
    pub data_dir: PathBuf,
    pub public_url: String,
    pub openrouter_base_url: String,
    pub fallback_api_key: Option<String>,
    pub title_model: String,
    pub exa_api_key: Option<String>,
    pub sandbox: SandboxMode,
    pub session_ttl_days: i64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind = get("SPEEDCHAT_BIND").unwrap_or_else(|| "127.0.0.1:3000".to_string());
        let public_url = get("SPEEDCHAT_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{}", bind))
            .trim_end_matches('/')
            .to_string();
        let sandbox = match get("SANDBOX_BACKEND") {
            Some(raw) => SandboxMode::parse(&raw)
                .with_context(|| format!("Unsupported SANDBOX_BACKEND '{}'", raw))?,
            None => SandboxMode::Off,
        };
        let session_ttl_days = match get("SESSION_TTL_DAYS") {
            Some(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("SESSION_TTL_DAYS must be an integer, got '{}'", raw))?,
            None => 30,
        };

        Ok(Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://speedchat.sqlite?mode=rwc".to_string()),
            data_dir: PathBuf::from(get("SPEEDCHAT_DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            public_url,
            openrouter_base_url: get("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            fallback_api_key: get("OPENROUTER_API_KEY"),
            title_model: get("TITLE_MODEL").unwrap_or_else(|| "google/gemini-2.5-flash".to_string()),
            exa_api_key: get("EXA_API_KEY"),
            sandbox,
            session_ttl_days,
            bind,
        })
    }
}

/// Retrieves the OpenRouter key for a request.
/// The client's own key (`X-API-Key`) wins; the server key is only a fallback.
pub fn resolve_api_key(headers: &HeaderMap, settings: &Settings) -> Result<String> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        let key = value
            .to_str()
            .context("X-API-Key header is not valid ASCII")?
            .trim();
        if !key.is_empty() {
            log::debug!("Using API key from request header");
            return Ok(key.to_string());
        }
    }
    match settings.fallback_api_key.as_deref() {
        Some(key) => {
            log::debug!("Using API key from OPENROUTER_API_KEY");
            Ok(key.to_string())
        }
        None => Err(crate::error::bad_request("Missing API key")),
    }
}
