use std::sync::Arc;

use rmcp::{ErrorData as McpError, model::*};
use serde_json::Value;

use crate::registry::ToolRegistry;
use crate::router::RequestRouter;

/// List every prompt currently known to the registry, under its namespaced
/// key so `get_prompt` can route it back to the owning backend.
pub fn list_prompts(registry: &Arc<ToolRegistry>) -> Vec<Prompt> {
    registry
        .all_prompts()
        .into_iter()
        .filter(|(_, entry)| entry.enabled)
        .map(|(key, entry)| Prompt {
            name: key,
            title: None,
            description: entry.description,
            arguments: serde_json::from_value(entry.arguments).unwrap_or(None),
            icons: None,
            meta: None,
        })
        .collect()
}

/// Get a prompt by its namespaced key, dispatching to its owning backend.
pub async fn get_prompt(
    registry: &Arc<ToolRegistry>,
    router: &Arc<RequestRouter>,
    key: &str,
    arguments: Option<JsonObject>,
) -> Result<GetPromptResult, McpError> {
    if registry.get_prompt(key).is_none() {
        return Err(McpError::invalid_params(format!("prompt '{key}' not found"), None));
    }

    let value = router
        .get_prompt(key, arguments.map(Value::Object))
        .await
        .map_err(crate::resources::router_error_to_mcp)?;

    serde_json::from_value(value)
        .map_err(|e| McpError::internal_error(format!("malformed prompt result: {e}"), None))
}
