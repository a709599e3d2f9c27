use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::{FunctionDefinition, ToolDefinition};
use crate::config::Settings;
use crate::sandbox::{Language, Sandbox, SandboxMode};

const EXA_SEARCH_URL: &str = "https://api.exa.ai/search";
const SEARCH_RESULTS: u32 = 5;
const SEARCH_TEXT_CHARS: u32 = 3000;

/// A function the model may call during a chat step.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema of the input object.
    fn parameters(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tools enabled by the environment: web search needs `EXA_API_KEY`,
    /// code execution needs a sandbox backend.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        match &settings.exa_api_key {
            Some(key) => registry.register(Arc::new(WebSearchTool::new(key))),
            None => log::info!("EXA_API_KEY not set, webSearch tool disabled"),
        }
        if settings.sandbox == SandboxMode::Off {
            log::info!("Sandbox backend is off, codeExecution tool disabled");
        } else {
            registry.register(Arc::new(CodeExecutionTool::new(Sandbox::new(settings.sandbox))));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        log::debug!("Registered tool {}", tool.name());
        self.tools.insert(tool.name(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }

    /// Runs a tool call. Failures come back as `{"error": ...}` so the model
    /// can see them.
    pub async fn execute(&self, name: &str, input: Value) -> Value {
        let Some(tool) = self.tools.get(name) else {
            log::warn!("Model called unknown tool {}", name);
            return json!({ "error": format!("Unknown tool: {}", name) });
        };
        log::info!("Executing tool {}", name);
        match tool.execute(input).await {
            Ok(output) => output,
            Err(e) => {
                log::warn!("Tool {} failed: {:#}", name, e);
                json!({ "error": format!("{:#}", e) })
            }
        }
    }
}

// --- webSearch ---

#[derive(Deserialize)]
struct WebSearchInput {
    query: String,
}

#[derive(Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExaResult {
    title: Option<String>,
    url: String,
    published_date: Option<String>,
    text: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    pub text: String,
}

impl From<ExaResult> for SearchResult {
    fn from(r: ExaResult) -> Self {
        Self {
            title: r.title.unwrap_or_default(),
            url: r.url,
            published_date: r.published_date,
            text: r.text.unwrap_or_default(),
        }
    }
}

pub struct WebSearchTool {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            endpoint: EXA_SEARCH_URL.to_string(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "webSearch"
    }

    fn description(&self) -> &'static str {
        "Search the web for up-to-date information."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let input: WebSearchInput = serde_json::from_value(input).context("Invalid webSearch input")?;
        log::debug!("Searching the web for: {}", input.query);
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "query": input.query,
                "type": "auto",
                "numResults": SEARCH_RESULTS,
                "contents": { "text": { "maxCharacters": SEARCH_TEXT_CHARS } }
            }))
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Search failed with status {}: {}", status, body);
        }
        let body: ExaResponse = response.json().await.context("Failed to parse search response")?;
        let results: Vec<SearchResult> = body.results.into_iter().map(SearchResult::from).collect();
        log::debug!("Search returned {} results", results.len());
        Ok(serde_json::to_value(results)?)
    }
}

// --- codeExecution ---

#[derive(Deserialize)]
struct CodeExecutionInput {
    code: String,
    language: Language,
}

pub struct CodeExecutionTool {
    sandbox: Sandbox,
}

impl CodeExecutionTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for CodeExecutionTool {
    fn name(&self) -> &'static str {
        "codeExecution"
    }

    fn description(&self) -> &'static str {
        "Execute Python or Node.js code in an isolated sandbox and return stdout, stderr and the exit code. Max execution time is 30 seconds."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "The code to execute" },
                "language": {
                    "type": "string",
                    "enum": ["python", "nodejs"],
                    "description": "The runtime to execute the code with"
                }
            },
            "required": ["code", "language"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let input: CodeExecutionInput = serde_json::from_value(input).context("Invalid codeExecution input")?;
        let result = self.sandbox.execute(&input.code, input.language).await;
        Ok(serde_json::to_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "Echoes its input"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, input: Value) -> Result<Value> {
            if input.get("fail").is_some() {
                anyhow::bail!("asked to fail");
            }
            Ok(input)
        }
    }

    #[tokio::test]
    async fn registry_reports_unknown_tools_and_failures_as_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert_eq!(registry.execute("echo", json!({"a": 1})).await, json!({"a": 1}));
        assert_eq!(
            registry.execute("echo", json!({"fail": true})).await,
            json!({"error": "asked to fail"})
        );
        assert_eq!(
            registry.execute("nope", json!({})).await,
            json!({"error": "Unknown tool: nope"})
        );
    }

    #[test]
    fn settings_decide_enabled_tools() {
        let mut settings = Settings::from_lookup(|_| None).unwrap();
        assert!(ToolRegistry::from_settings(&settings).is_empty());

        settings.exa_api_key = Some("exa".into());
        settings.sandbox = SandboxMode::Direct;
        let names: Vec<_> = ToolRegistry::from_settings(&settings)
            .definitions()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, ["codeExecution", "webSearch"]);
    }

    #[tokio::test]
    async fn code_execution_rejects_unknown_language() {
        let tool = CodeExecutionTool::new(Sandbox::new(SandboxMode::Off));
        assert!(tool.execute(json!({"code": "1", "language": "ruby"})).await.is_err());
        let output = tool
            .execute(json!({"code": "print(1)", "language": "python"}))
            .await
            .unwrap();
        assert_eq!(output["error"], "Code execution is disabled");
    }

    #[test]
    fn exa_results_map_to_search_results() {
        let body: ExaResponse = serde_json::from_value(json!({
            "results": [
                {"title": "Rust", "url": "https://rust-lang.org", "publishedDate": "2025-01-01", "text": "A language", "score": 0.9},
                {"url": "https://example.com"}
            ]
        }))
        .unwrap();
        let results: Vec<SearchResult> = body.results.into_iter().map(SearchResult::from).collect();
        assert_eq!(results[0].published_date.as_deref(), Some("2025-01-01"));
        let second = serde_json::to_value(&results[1]).unwrap();
        assert_eq!(second, json!({"title": "", "url": "https://example.com", "text": ""}));
    }
}
