//! HTTP + SSE upstream transport (spec.md §4.7): one long-lived SSE session
//! at `GET /sse` paired with `POST /messages`, plus authenticated auxiliary
//! JSON endpoints for fleet management. Always compiled in — this is not an
//! optional surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use rmcp::transport::sse_server::{SseServer as RmcpSseServer, SseServerConfig};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap;
use crate::registry::{ToolRegistry, split_key};
use crate::router::RequestRouter;
use crate::secrets::resolver::SecretResolver;
use crate::server::GatewayServer;
use crate::session::SessionManager;
use crate::trigger::TriggerManager;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<RequestRouter>,
    pub resolver: Arc<SecretResolver>,
    pub cache_path: std::path::PathBuf,
    pub api_key: String,
    pub debug: bool,
}

/// Bind the SSE transport and auxiliary admin endpoints and serve until
/// `shutdown` is notified.
pub async fn start(
    state: AdminState,
    trigger: Arc<TriggerManager>,
    retrieval: Option<Arc<crate::retrieval::RetrievalPipeline>>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let ct = CancellationToken::new();
    let sse_config = SseServerConfig {
        bind: addr,
        sse_path: "/sse".to_string(),
        post_path: "/messages".to_string(),
        ct: ct.clone(),
        sse_keep_alive: None,
    };
    let (sse_server, sse_router) = RmcpSseServer::new(sse_config);

    let registry = Arc::clone(&state.registry);
    let gw_router = Arc::clone(&state.router);
    let _ct_guard = sse_server.with_service_directly(move || {
        GatewayServer::new(
            Arc::clone(&registry),
            Arc::clone(&gw_router),
            retrieval.clone(),
            Arc::clone(&trigger),
        )
    });

    let aux = Router::new()
        .route("/health", get(health))
        .route("/mcp_servers", get(list_servers).post(add_servers))
        .route("/mcp_servers/{name}", delete(remove_server))
        .route("/mcp_tools", get(list_tools))
        .route("/mcp_control", post(control))
        .with_state(state.clone());

    let app = sse_router
        .merge(aux)
        .layer(middleware::from_fn_with_state(state.api_key.clone(), auth_layer));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin/SSE transport started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            ct.cancel();
        })
        .await?;
    info!("admin/SSE transport stopped");
    Ok(())
}

/// Constant-time bearer-token check applied to every path. A blank
/// configured key disables auth entirely (local/trusted-network use).
async fn auth_layer(
    State(api_key): State<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if api_key.is_empty() {
        return next.run(request).await;
    }

    let header_token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let candidate = header_token.or_else(|| query.get("token").map(String::as_str));

    match candidate {
        Some(token) if bool::from(token.as_bytes().ct_eq(api_key.as_bytes())) => {
            next.run(request).await
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    total_tools: usize,
    total_backends: usize,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        total_tools: state.registry.tool_count(),
        total_backends: state.registry.backend_names().len(),
    })
}

#[derive(Serialize)]
struct ServersResponse {
    active_servers: Vec<String>,
    pending_servers: Vec<String>,
}

async fn list_servers(State(state): State<AdminState>) -> Json<ServersResponse> {
    Json(ServersResponse {
        active_servers: state.sessions.active_names(),
        pending_servers: state.sessions.pending_names(),
    })
}

#[derive(Deserialize)]
struct AddServersRequest {
    #[serde(rename = "mcpServers")]
    mcp_servers: std::collections::HashMap<String, crate::config::BackendConfig>,
}

async fn add_servers(
    State(state): State<AdminState>,
    body: Result<Json<AddServersRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(j) => j,
        Err(_) => return unprocessable(&state, "invalid mcpServers payload"),
    };

    for (name, mut config) in payload.mcp_servers {
        if let Err(e) = state.resolver.resolve_map(&mut config.env) {
            return handler_error(&state, &e.to_string());
        }
        state.sessions.register_pending(&name, config.clone());
        let descriptor = bootstrap::descriptor_from_config(&config);
        state.registry.set_descriptor(&name, descriptor);
        if let Err(e) =
            bootstrap::discover_one(&name, &state.sessions, &state.registry).await
        {
            tracing::warn!(backend = %name, error = %e, "discovery failed for newly added server");
        }
    }
    crate::cache::save(&state.cache_path, &state.registry).await;

    StatusCode::OK.into_response()
}

async fn remove_server(State(state): State<AdminState>, Path(name): Path<String>) -> StatusCode {
    state.sessions.unregister(&name).await;
    state.registry.unregister(&name);
    crate::cache::save(&state.cache_path, &state.registry).await;
    StatusCode::OK
}

#[derive(Serialize)]
struct ToolListEntry {
    key: String,
    backend: String,
    name: String,
    enabled: bool,
    stale: bool,
}

async fn list_tools(State(state): State<AdminState>) -> Json<Vec<ToolListEntry>> {
    let entries = state
        .registry
        .all_tools()
        .into_iter()
        .map(|(key, entry)| ToolListEntry {
            key,
            backend: entry.backend_name,
            name: entry.name,
            enabled: entry.enabled,
            stale: entry.stale,
        })
        .collect();
    Json(entries)
}

#[derive(Deserialize)]
struct ControlRequest {
    server: String,
    tool: Option<String>,
    enabled: bool,
}

async fn control(
    State(state): State<AdminState>,
    body: Result<Json<ControlRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(j) => j,
        Err(_) => return unprocessable(&state, "invalid mcp_control payload"),
    };

    match req.tool {
        Some(tool) => {
            state.registry.toggle_tool(&req.server, &tool, req.enabled);
        }
        None => {
            for (key, _) in state.registry.tools_for_backend(&req.server) {
                if let Some((server, tool)) = split_key(&key) {
                    state.registry.toggle_tool(server, tool, req.enabled);
                }
            }
        }
    }

    crate::cache::save(&state.cache_path, &state.registry).await;
    StatusCode::OK.into_response()
}

fn unprocessable(state: &AdminState, message: &str) -> Response {
    let detail: Option<&str> = state.debug.then_some(message);
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({"detail": detail})),
    )
        .into_response()
}

fn handler_error(state: &AdminState, message: &str) -> Response {
    let detail: Option<&str> = state.debug.then_some(message);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"detail": detail})),
    )
        .into_response()
}
