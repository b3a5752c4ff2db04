use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::RequestContext,
};
use serde_json::Value;
use uuid::Uuid;

use crate::registry::ToolRegistry;
use crate::retrieval::RetrievalPipeline;
use crate::router::{RequestRouter, RouterError};
use crate::trigger::TriggerManager;

/// The MCP server exposed to upstream clients. Every live backend tool is
/// exposed directly under its namespaced key (`"<server>__<tool>"`) — there
/// is no meta-tool layer to call through.
///
/// One instance is constructed per connection (stdio: once for the process;
/// SSE: once per accepted session), so `session_id` is stable for the
/// instance's lifetime and is what the retrieval pipeline keys its
/// progressive-disclosure state on.
#[derive(Clone)]
pub struct GatewayServer {
    registry: Arc<ToolRegistry>,
    router: Arc<RequestRouter>,
    retrieval: Option<Arc<RetrievalPipeline>>,
    trigger: Arc<TriggerManager>,
    session_id: String,
}

impl GatewayServer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        router: Arc<RequestRouter>,
        retrieval: Option<Arc<RetrievalPipeline>>,
        trigger: Arc<TriggerManager>,
    ) -> Self {
        Self {
            registry,
            router,
            retrieval,
            trigger,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    fn tool_list(&self) -> Vec<Tool> {
        match &self.retrieval {
            Some(retrieval) => retrieval
                .get_tools_for_list(&self.session_id)
                .into_iter()
                .map(assembled_to_tool)
                .collect(),
            None => self
                .registry
                .all_tools()
                .into_iter()
                .filter(|(_, entry)| entry.enabled)
                .map(|(key, entry)| Tool {
                    name: key.into(),
                    title: None,
                    description: Some(entry.description.into()),
                    input_schema: schema_to_arc(entry.input_schema),
                    output_schema: None,
                    annotations: None,
                    icons: None,
                })
                .collect(),
        }
    }
}

fn schema_to_arc(schema: Value) -> Arc<serde_json::Map<String, Value>> {
    match schema {
        Value::Object(obj) => Arc::new(obj),
        _ => Arc::new(serde_json::Map::new()),
    }
}

fn assembled_to_tool(tool: crate::retrieval::AssembledTool) -> Tool {
    Tool {
        name: tool.key.into(),
        title: None,
        description: Some(tool.description.into()),
        input_schema: schema_to_arc(tool.input_schema),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn value_to_call_result(value: Value) -> CallToolResult {
    let text = match value {
        Value::String(s) => s,
        other => serde_json::to_string(&other).unwrap_or_default(),
    };
    CallToolResult::success(vec![Content::text(text)])
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server federates a fleet of backend MCP servers behind a single \
                 namespaced catalog. Every tool is named `<backend>__<tool>` and is called \
                 directly, with no meta-tool indirection. Prompts and resources are passed \
                 through from their owning backend unchanged; resource URIs are never \
                 namespaced. If a configured retrieval pipeline is active, `tools/list` only \
                 discloses a subset of the catalog per session — anchor tools plus whatever \
                 has been called so far — and grows monotonically as tools are used, \
                 announced via `tools/list_changed`."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: self.tool_list(),
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let key = request.name.to_string();
        let arguments = request.arguments.clone().map(Value::Object);

        match self.router.call_tool(&self.session_id, &key, arguments.clone()).await {
            Ok((value, list_changed)) => {
                if list_changed {
                    notify_list_changed(&context).await;
                }
                Ok(value_to_call_result(value))
            }
            Err(RouterError::NotFound(_)) => {
                // The trigger manager gets one chance to lazily enable a
                // backend whose keyword matched this call before giving up.
                self.trigger
                    .on_message(&serde_json::json!({"tool": key, "arguments": arguments}))
                    .await;

                if self.registry.get_tool(&key).is_some() {
                    match self.router.call_tool(&self.session_id, &key, arguments).await {
                        Ok((value, list_changed)) => {
                            if list_changed {
                                notify_list_changed(&context).await;
                            }
                            Ok(value_to_call_result(value))
                        }
                        Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
                    }
                } else {
                    Ok(CallToolResult::error(vec![Content::text(format!(
                        "tool '{key}' not found"
                    ))]))
                }
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            meta: None,
            next_cursor: None,
            resources: crate::resources::list_resources(&self.registry),
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        Ok(ListResourceTemplatesResult {
            meta: None,
            next_cursor: None,
            resource_templates: Vec::new(),
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        crate::resources::read_resource(&request.uri, &self.router).await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            meta: None,
            next_cursor: None,
            prompts: crate::prompts::list_prompts(&self.registry),
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        crate::prompts::get_prompt(&self.registry, &self.router, &request.name, request.arguments).await
    }
}

async fn notify_list_changed(context: &RequestContext<RoleServer>) {
    if let Err(e) = context.peer.notify_tool_list_changed().await {
        tracing::debug!(error = %e, "failed to send tools/list_changed notification");
    }
}
