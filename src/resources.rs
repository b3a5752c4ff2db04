use std::sync::Arc;

use rmcp::{ErrorData as McpError, model::*};

use crate::registry::ToolRegistry;
use crate::router::{RequestRouter, RouterError};

/// List every resource currently known to the registry, passed through
/// unchanged from its owning backend. Resource URIs are never namespaced —
/// they are already globally scoped (`file:///...`, `https://...`).
pub fn list_resources(registry: &Arc<ToolRegistry>) -> Vec<Resource> {
    registry
        .all_resources()
        .into_iter()
        .filter(|entry| entry.enabled)
        .map(|entry| Resource {
            raw: RawResource {
                uri: entry.uri,
                name: entry.name.unwrap_or_default(),
                title: None,
                description: entry.description,
                mime_type: entry.mime_type,
                size: None,
                icons: None,
                meta: None,
            },
            annotations: None,
        })
        .collect()
}

/// Read a resource by its raw URI, dispatching to whichever backend owns it.
pub async fn read_resource(
    uri: &str,
    router: &Arc<RequestRouter>,
) -> Result<ReadResourceResult, McpError> {
    let value = router
        .read_resource(uri)
        .await
        .map_err(router_error_to_mcp)?;

    serde_json::from_value(value)
        .map_err(|e| McpError::internal_error(format!("malformed resource contents: {e}"), None))
}

pub(crate) fn router_error_to_mcp(err: RouterError) -> McpError {
    match err {
        RouterError::NotFound(key) => McpError::invalid_params(format!("'{key}' not found"), None),
        RouterError::Disabled(key) => {
            McpError::invalid_params(format!("'{key}' is disabled"), None)
        }
        other => McpError::internal_error(other.to_string(), None),
    }
}
