//! Runs model-written snippets for the `codeExecution` tool.
//!
//! `SANDBOX_BACKEND` selects the isolation:
//! - `off`: tool is not offered to the model.
//! - `direct`: runs `python3` / `node` on the host in a throwaway directory.
//! - `docker`: runs inside `docker run --rm --network none` with the runtime image.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Off,
    Direct,
    Docker,
}

impl SandboxMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "direct" => Some(Self::Direct),
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Nodejs,
}

impl Language {
    fn command(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Nodejs => "node",
        }
    }

    fn filename(&self) -> &'static str {
        match self {
            Language::Python => "script.py",
            Language::Nodejs => "script.js",
        }
    }

    fn image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.13-slim",
            Language::Nodejs => "node:24-slim",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    mode: SandboxMode,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(mode: SandboxMode) -> Self {
        Self {
            mode,
            timeout: EXECUTION_TIMEOUT,
        }
    }

    /// Never fails: setup and runtime problems are reported in `error`.
    pub async fn execute(&self, code: &str, language: Language) -> ExecutionResult {
        let started = Instant::now();
        match self.run(code, language).await {
            Ok(mut result) => {
                result.execution_time_ms = started.elapsed().as_millis() as u64;
                result
            }
            Err(e) => {
                log::warn!("Sandbox execution failed: {:#}", e);
                ExecutionResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 1,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn run(&self, code: &str, language: Language) -> Result<ExecutionResult> {
        let workdir = tempfile::tempdir().context("Failed to create sandbox directory")?;
        let script = workdir.path().join(language.filename());
        tokio::fs::write(&script, code)
            .await
            .context("Failed to write script into sandbox")?;

        let mut command = match self.mode {
            SandboxMode::Off => anyhow::bail!("Code execution is disabled"),
            SandboxMode::Direct => {
                let mut c = Command::new(language.command());
                c.arg(language.filename()).current_dir(workdir.path());
                c
            }
            SandboxMode::Docker => {
                let mut c = Command::new("docker");
                c.args(["run", "--rm", "--network", "none", "-v"])
                    .arg(format!("{}:/work", workdir.path().display()))
                    .args(["-w", "/work", language.image(), language.command(), language.filename()]);
                c
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Running {:?} snippet in {:?} sandbox", language, self.mode);
        let child = command.spawn().context("Failed to start sandbox process")?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Failed to collect sandbox output")?,
            Err(_) => anyhow::bail!(
                "Execution timed out after {} seconds",
                self.timeout.as_secs()
            ),
        };

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time_ms: 0,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backends() {
        assert_eq!(SandboxMode::parse("Docker"), Some(SandboxMode::Docker));
        assert_eq!(SandboxMode::parse("none"), Some(SandboxMode::Off));
        assert_eq!(SandboxMode::parse("firecracker"), None);
    }

    #[tokio::test]
    async fn disabled_sandbox_reports_error_in_result() {
        let result = Sandbox::new(SandboxMode::Off)
            .execute("print(1)", Language::Python)
            .await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error.as_deref(), Some("Code execution is disabled"));
    }

    #[test]
    fn result_serializes_like_the_tool_contract() {
        let r = ExecutionResult {
            stdout: "2".into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time_ms: 12,
            error: None,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["exitCode"], 0);
        assert_eq!(v["executionTimeMs"], 12);
        assert!(v.get("error").is_none());
    }
}
