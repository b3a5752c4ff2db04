pub mod http;
pub mod lenient_client;
pub mod stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolResult, RawContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::{BackendConfig, Transport};

pub(crate) const STATE_STARTING: u8 = 0;
pub(crate) const STATE_HEALTHY: u8 = 1;
pub(crate) const STATE_UNHEALTHY: u8 = 3;
pub(crate) const STATE_STOPPED: u8 = 7;

/// Environment variables stripped from every spawned subprocess regardless
/// of what the backend's own `env` map requests, to prevent a malicious or
/// compromised backend descriptor from hijacking the gateway process itself
/// via loader/interpreter hooks.
pub const PROTECTED_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "BASH_ENV",
    "ENV",
    "PYTHONPATH",
    "PYTHONHOME",
    "NODE_OPTIONS",
    "NODE_PATH",
    "http_proxy",
    "https_proxy",
    "PATH",
    "HOME",
    "USER",
];

/// Default allowlist of subprocess command basenames. Overridable per
/// deployment via the `MULTIMCP_ALLOWED_COMMANDS` env var (comma-separated).
const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "node", "npx", "python", "python3", "uv", "uvx", "docker", "deno", "bun",
];

/// Returns true if `command`'s basename is on the allowlist. Accepts either a
/// bare command name or a full path — only the basename is checked, so
/// `/usr/bin/node` and `node` are equivalent.
pub fn is_command_allowed(command: &str) -> bool {
    let basename = std::path::Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command);

    let allowed: Vec<String> = match std::env::var("MULTIMCP_ALLOWED_COMMANDS") {
        Ok(csv) if !csv.trim().is_empty() => {
            csv.split(',').map(|s| s.trim().to_string()).collect()
        }
        _ => DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
    };

    allowed.iter().any(|a| a == basename)
}

/// Map a CallToolResult to a JSON Value, collapsing a single text block to a
/// bare string and multiple blocks to an array.
pub(crate) fn map_call_tool_result(result: CallToolResult) -> Value {
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();

    if contents.len() == 1 {
        contents.into_iter().next().unwrap()
    } else {
        Value::Array(contents)
    }
}

/// Map rmcp's Tool list into the (name, description, input_schema) tuples
/// the capability registry stores.
pub(crate) fn map_tools_to_entries(tools: Vec<rmcp::model::Tool>) -> Vec<(String, String, Value)> {
    tools
        .into_iter()
        .map(|t| {
            (
                t.name.to_string(),
                t.description.unwrap_or_default().to_string(),
                serde_json::to_value(&t.input_schema).unwrap_or(Value::Object(Default::default())),
            )
        })
        .collect()
}

/// Map rmcp's Prompt list into (name, description, arguments) tuples.
pub(crate) fn map_prompts_to_entries(
    prompts: Vec<rmcp::model::Prompt>,
) -> Vec<(String, Option<String>, Value)> {
    prompts
        .into_iter()
        .map(|p| {
            let args = serde_json::to_value(&p.arguments).unwrap_or(Value::Array(Vec::new()));
            (p.name, p.description, args)
        })
        .collect()
}

/// Map rmcp's Resource list into (uri, name, description, mime_type) tuples.
pub(crate) fn map_resources_to_entries(
    resources: Vec<rmcp::model::Resource>,
) -> Vec<(String, Option<String>, Option<String>, Option<String>)> {
    resources
        .into_iter()
        .map(|r| {
            let raw = r.raw;
            (
                raw.uri,
                Some(raw.name),
                raw.description,
                raw.mime_type,
            )
        })
        .collect()
}

pub(crate) fn state_from_atomic(state: &AtomicU8) -> BackendState {
    match state.load(Ordering::Acquire) {
        STATE_STARTING => BackendState::Starting,
        STATE_HEALTHY => BackendState::Healthy,
        STATE_UNHEALTHY => BackendState::Unhealthy,
        STATE_STOPPED => BackendState::Stopped,
        _ => BackendState::Unhealthy,
    }
}

pub(crate) fn is_available_from_atomic(state: &AtomicU8) -> bool {
    state.load(Ordering::Acquire) == STATE_HEALTHY
}

pub(crate) fn store_state(atomic: &AtomicU8, state: BackendState) {
    let val = match state {
        BackendState::Starting => STATE_STARTING,
        BackendState::Healthy => STATE_HEALTHY,
        BackendState::Unhealthy => STATE_UNHEALTHY,
        BackendState::Stopped => STATE_STOPPED,
    };
    atomic.store(val, Ordering::Release);
}

/// Backend connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

/// A live connection to a single upstream MCP server, over whichever
/// transport it was reached by (stdio child process, streamable-HTTP, or
/// SSE). The session manager owns the lifecycle of these; callers reach a
/// backend only through the session manager's lookup.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value>;
    async fn discover_tools(&self) -> Result<Vec<(String, String, Value)>>;
    async fn discover_prompts(&self) -> Result<Vec<(String, Option<String>, Value)>> {
        Ok(Vec::new())
    }
    async fn discover_resources(
        &self,
    ) -> Result<Vec<(String, Option<String>, Option<String>, Option<String>)>> {
        Ok(Vec::new())
    }
    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value>;
    async fn read_resource(&self, uri: &str) -> Result<Value>;
    fn is_available(&self) -> bool;
    fn state(&self) -> BackendState;
    fn set_state(&self, state: BackendState);

    /// Wait for the backend process to exit. Returns immediately with `None`
    /// for backends with no child process to monitor (HTTP/SSE).
    async fn wait_for_exit(&self) -> Option<std::process::ExitStatus> {
        None
    }
}

/// Connect to a backend using the configured or auto-detected transport.
///
/// Explicit transport hints are honored with no fallback. An absent hint on
/// a URL-based backend tries streamable-HTTP first and falls back to SSE on
/// any connect failure. This exact procedure is shared by lazy-connect,
/// watchdog reconnection, and first-run discovery — those paths must never
/// diverge, or they silently partition backends into "ones that work from
/// cache" and "ones that work from cold start".
pub async fn connect(name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    match config.transport {
        Some(Transport::Stdio) => {
            if config.command.is_none() {
                anyhow::bail!("backend '{name}': stdio transport requires 'command'");
            }
            let backend = stdio::StdioBackend::new(name.to_string(), config.clone());
            backend.start().await?;
            Ok(Arc::new(backend))
        }
        Some(Transport::Sse) => {
            let backend = http::HttpBackend::new(name.to_string(), config.clone());
            backend.start_sse().await?;
            Ok(Arc::new(backend))
        }
        Some(Transport::StreamableHttp | Transport::Http) => {
            let backend = http::HttpBackend::new(name.to_string(), config.clone());
            backend.start_streamable().await?;
            Ok(Arc::new(backend))
        }
        None => {
            if config.command.is_some() {
                let backend = stdio::StdioBackend::new(name.to_string(), config.clone());
                backend.start().await?;
                return Ok(Arc::new(backend));
            }
            if config.url.is_none() {
                anyhow::bail!("backend '{name}': must specify 'command' or 'url'");
            }
            let backend = http::HttpBackend::new(name.to_string(), config.clone());
            match backend.start_streamable().await {
                Ok(()) => Ok(Arc::new(backend)),
                Err(streamable_err) => {
                    tracing::warn!(
                        backend = %name,
                        error = %streamable_err,
                        "streamable-HTTP connect failed, falling back to SSE"
                    );
                    let fallback = http::HttpBackend::new(name.to_string(), config.clone());
                    fallback
                        .start_sse()
                        .await
                        .with_context(|| format!("SSE fallback also failed for backend '{name}'"))?;
                    Ok(Arc::new(fallback))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_command_allowed_basename_match() {
        assert!(is_command_allowed("node"));
        assert!(is_command_allowed("/usr/bin/node"));
        assert!(is_command_allowed("/tmp/node"));
        assert!(!is_command_allowed("/tmp/evil"));
        assert!(!is_command_allowed("bash"));
    }

    #[test]
    fn test_map_call_tool_result_single_text() {
        use rmcp::model::{CallToolResult, Content};
        let result = CallToolResult::success(vec![Content::text("hello")]);
        let value = map_call_tool_result(result);
        assert_eq!(value, Value::String("hello".to_string()));
    }
}
