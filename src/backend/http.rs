use anyhow::{Context, Result};
use rmcp::{
    ServiceExt,
    model::*,
    service::RunningService,
    transport::sse_client::SseClientTransport,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::lenient_client::LenientClient;
use super::{Backend, BackendState, STATE_HEALTHY, STATE_STARTING, STATE_STOPPED};
use super::{
    is_available_from_atomic, map_call_tool_result, map_prompts_to_entries,
    map_resources_to_entries, map_tools_to_entries, state_from_atomic, store_state,
};
use crate::config::BackendConfig;

/// A streamable-HTTP or SSE MCP backend reached over reqwest.
///
/// Which wire protocol is in use is decided once at connect time (see
/// `connect()` in `backend::mod`) and recorded for diagnostics only; both
/// `start_streamable` and `start_sse` populate the same `service` slot and
/// every other method is transport-agnostic from there on.
pub struct HttpBackend {
    name: String,
    config: BackendConfig,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    state: AtomicU8,
}

impl HttpBackend {
    pub fn new(name: String, config: BackendConfig) -> Self {
        Self {
            name,
            config,
            service: RwLock::new(None),
            state: AtomicU8::new(STATE_STARTING),
        }
    }

    /// Build the reqwest client used for this connect attempt. `pinned`, when
    /// non-empty, is the `(host, addrs)` pair already resolved and checked by
    /// `ssrf::check_url`; passing it to `resolve_to_addrs` makes reqwest
    /// reuse those exact addresses instead of re-resolving the hostname,
    /// so a DNS answer that changes between the SSRF check and the real
    /// connect can't hand the client a different (and disallowed) address.
    fn build_client(&self, pinned: Option<(&str, &[std::net::SocketAddr])>) -> Result<LenientClient> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            if key.eq_ignore_ascii_case("Authorization") {
                continue;
            }
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(val)) => {
                    default_headers.insert(name, val);
                }
                _ => {
                    warn!(backend = %self.name, header = %key, "skipping unparseable custom header");
                }
            }
        }

        let mut builder = reqwest::Client::builder().default_headers(default_headers);
        if let Some((host, addrs)) = pinned
            && !addrs.is_empty()
        {
            builder = builder.resolve_to_addrs(host, addrs);
        }

        let reqwest_client = builder.build().context("failed to build HTTP client")?;

        // Wrap in LenientClient to tolerate missing Content-Type on responses
        // (e.g. some servers return 200 with no Content-Type for the
        // initialized notification).
        Ok(LenientClient::new(reqwest_client))
    }

    fn auth_token(&self) -> Option<&str> {
        self.config
            .headers
            .get("Authorization")
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth))
    }

    /// Connect via rmcp's streamable-HTTP client transport.
    pub async fn start_streamable(&self) -> Result<()> {
        self.state.store(STATE_STARTING, Ordering::Release);

        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' missing url", self.name))?;

        let resolved = crate::ssrf::check_url(url)
            .await
            .with_context(|| format!("SSRF policy rejected backend '{}'", self.name))?;
        let host = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url);
        if let Some(token) = self.auth_token() {
            transport_config = transport_config.auth_header(token);
        }

        let client = self.build_client(host.as_deref().map(|h| (h, resolved.as_slice())))?;
        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let service = ().serve(transport).await.with_context(|| {
            format!(
                "failed streamable-HTTP MCP handshake with backend '{}' at {}",
                self.name, url
            )
        })?;

        self.finish_connect(service, url, "streamable-HTTP").await
    }

    /// Connect via rmcp's SSE client transport, used when an explicit `sse`
    /// hint is given, or as the auto-detect fallback when streamable-HTTP
    /// fails to connect.
    pub async fn start_sse(&self) -> Result<()> {
        self.state.store(STATE_STARTING, Ordering::Release);

        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' missing url", self.name))?;

        let resolved = crate::ssrf::check_url(url)
            .await
            .with_context(|| format!("SSRF policy rejected backend '{}'", self.name))?;
        let host = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));

        let client = self.build_client(host.as_deref().map(|h| (h, resolved.as_slice())))?;
        let transport = SseClientTransport::start_with_client(client, url.to_string())
            .await
            .with_context(|| format!("failed to open SSE stream for backend '{}' at {}", self.name, url))?;

        let service = ().serve(transport).await.with_context(|| {
            format!("failed SSE MCP handshake with backend '{}' at {}", self.name, url)
        })?;

        self.finish_connect(service, url, "SSE").await
    }

    async fn finish_connect(
        &self,
        service: RunningService<rmcp::RoleClient, ()>,
        url: &str,
        transport_label: &str,
    ) -> Result<()> {
        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                url = %url,
                transport = transport_label,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "HTTP MCP handshake complete"
            );
        } else {
            info!(backend = %self.name, url = %url, transport = transport_label, "HTTP MCP handshake complete (no peer info)");
        }

        *self.service.write().await = Some(service);
        self.state.store(STATE_HEALTHY, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.start_streamable().await
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(STATE_STOPPED, Ordering::Release);

        let mut guard = self.service.write().await;
        if let Some(service) = guard.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling HTTP service");
        }

        info!(backend = %self.name, "HTTP backend stopped");
        Ok(())
    }

    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.name, tool = %tool_name, "calling tool via HTTP");

        let result = tokio::time::timeout(self.config.timeout, service.call_tool(params))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "tool call '{}' on HTTP backend '{}' timed out after {:?}",
                    tool_name,
                    self.name,
                    self.config.timeout
                )
            })?
            .map_err(|e| {
                anyhow::anyhow!("tool call '{}' on HTTP backend '{}' failed: {}", tool_name, self.name, e)
            })?;

        Ok(map_call_tool_result(result))
    }

    async fn discover_tools(&self) -> Result<Vec<(String, String, Value)>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tool discovery on HTTP backend '{}' failed: {}", self.name, e))?;

        let entries = map_tools_to_entries(tools);
        info!(backend = %self.name, tools = entries.len(), "discovered HTTP tools");
        Ok(entries)
    }

    async fn discover_prompts(&self) -> Result<Vec<(String, Option<String>, Value)>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        match service.list_all_prompts().await {
            Ok(prompts) => Ok(map_prompts_to_entries(prompts)),
            Err(e) => {
                debug!(backend = %self.name, error = %e, "backend does not support prompts");
                Ok(Vec::new())
            }
        }
    }

    async fn discover_resources(
        &self,
    ) -> Result<Vec<(String, Option<String>, Option<String>, Option<String>)>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        match service.list_all_resources().await {
            Ok(resources) => Ok(map_resources_to_entries(resources)),
            Err(e) => {
                debug!(backend = %self.name, error = %e, "backend does not support resources");
                Ok(Vec::new())
            }
        }
    }

    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        let params = GetPromptRequestParam {
            name: name.to_string(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
        };

        let result = service
            .get_prompt(params)
            .await
            .map_err(|e| anyhow::anyhow!("get_prompt '{}' on backend '{}' failed: {}", name, self.name, e))?;

        serde_json::to_value(result).context("failed to serialize prompt result")
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not started", self.name))?;

        let params = ReadResourceRequestParam {
            uri: uri.to_string(),
        };

        let result = service
            .read_resource(params)
            .await
            .map_err(|e| anyhow::anyhow!("read_resource '{}' on backend '{}' failed: {}", uri, self.name, e))?;

        serde_json::to_value(result).context("failed to serialize resource contents")
    }

    fn is_available(&self) -> bool {
        is_available_from_atomic(&self.state)
    }

    fn state(&self) -> BackendState {
        state_from_atomic(&self.state)
    }

    fn set_state(&self, state: BackendState) {
        store_state(&self.state, state);
    }
}
