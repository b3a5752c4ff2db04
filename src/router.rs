use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::registry::{ToolRegistry, make_key, split_key};
use crate::retrieval::RetrievalPipeline;
use crate::session::{SessionError, SessionManager};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown capability '{0}'")]
    NotFound(String),
    #[error("tool '{0}' is disabled")]
    Disabled(String),
    #[error("backend session error: {0}")]
    Session(#[from] SessionError),
    #[error("backend call failed: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Per-tool consecutive-transport-failure counter backing the circuit
/// breaker. A backend-reported `isError: true` result is a successful
/// round trip from the router's point of view and does not move this
/// counter — only failures to reach or talk to the backend at all count.
struct FailureCounter(AtomicU32);

/// Dispatches `tools/call`, `prompts/get`, and `resources/read` requests to
/// the owning backend, translating namespaced keys to raw names and back,
/// auto-quarantining tools whose backend keeps failing at the transport
/// level, and recording every outcome to the audit log with secrets
/// redacted.
pub struct RequestRouter {
    sessions: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
    audit: Arc<AuditLog>,
    failures: DashMap<String, FailureCounter>,
    quarantine_threshold: u32,
    cache_path: PathBuf,
    retrieval: Option<Arc<RetrievalPipeline>>,
}

impl RequestRouter {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ToolRegistry>,
        audit: Arc<AuditLog>,
        quarantine_threshold: u32,
        cache_path: PathBuf,
        retrieval: Option<Arc<RetrievalPipeline>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            registry,
            audit,
            failures: DashMap::new(),
            quarantine_threshold: quarantine_threshold.max(1),
            cache_path,
            retrieval,
        })
    }

    /// Call a namespaced tool (`"<server>__<tool>"`) on behalf of `session_id`.
    ///
    /// Returns the backend's result alongside whether a retrieval pipeline
    /// (if configured) grew the session's disclosed tool set as a result,
    /// so the caller can emit a `tools/list_changed` notification.
    pub async fn call_tool(
        &self,
        session_id: &str,
        key: &str,
        arguments: Option<Value>,
    ) -> Result<(Value, bool), RouterError> {
        let (server, tool) = split_key(key).ok_or_else(|| RouterError::NotFound(key.to_string()))?;

        // Disabled tools are absent from the registry's live map entirely,
        // so a quarantined or admin-disabled key is indistinguishable from
        // one that was never registered and falls through to `NotFound`.
        let _entry = self
            .registry
            .get_tool(key)
            .ok_or_else(|| RouterError::NotFound(key.to_string()))?;

        let backend = match self.sessions.get_or_create(server).await {
            Ok(b) => b,
            Err(e) => {
                self.note_transport_failure(server, tool).await;
                self.audit.record(
                    "tools/call",
                    Some(server),
                    Some(tool),
                    "connect_failed",
                    serde_json::json!({"error": e.to_string()}),
                );
                return Err(e.into());
            }
        };

        self.sessions.record_usage(server);

        match backend.call_tool(tool, arguments.clone()).await {
            Ok(result) => {
                self.note_success(server, tool);
                self.audit.record(
                    "tools/call",
                    Some(server),
                    Some(tool),
                    "ok",
                    serde_json::json!({"arguments": arguments}),
                );
                // Never let a retrieval-pipeline bug break an otherwise
                // successful tool call — the pipeline only disclosure-tracks,
                // it has no veto over the result itself.
                let list_changed = self
                    .retrieval
                    .as_ref()
                    .map(|r| r.on_tool_called(session_id, key))
                    .unwrap_or(false);
                Ok((result, list_changed))
            }
            Err(e) => {
                self.note_transport_failure(server, tool).await;
                self.audit.record(
                    "tools/call",
                    Some(server),
                    Some(tool),
                    "error",
                    serde_json::json!({"arguments": arguments, "error": e.to_string()}),
                );
                Err(e.into())
            }
        }
    }

    pub async fn get_prompt(&self, key: &str, arguments: Option<Value>) -> Result<Value, RouterError> {
        let (server, name) = split_key(key).ok_or_else(|| RouterError::NotFound(key.to_string()))?;
        let entry = self
            .registry
            .get_prompt(key)
            .ok_or_else(|| RouterError::NotFound(key.to_string()))?;
        if !entry.enabled {
            return Err(RouterError::Disabled(key.to_string()));
        }

        let backend = self.sessions.get_or_create(server).await?;
        self.sessions.record_usage(server);
        let result = backend.get_prompt(name, arguments.clone()).await?;
        self.audit.record(
            "prompts/get",
            Some(server),
            Some(name),
            "ok",
            serde_json::json!({"arguments": arguments}),
        );
        Ok(result)
    }

    /// Resource URIs are not namespaced — dispatch purely by looking up the
    /// owning backend in the registry.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, RouterError> {
        let entry = self
            .registry
            .get_resource(uri)
            .ok_or_else(|| RouterError::NotFound(uri.to_string()))?;
        if !entry.enabled {
            return Err(RouterError::Disabled(uri.to_string()));
        }

        let backend = self.sessions.get_or_create(&entry.backend_name).await?;
        self.sessions.record_usage(&entry.backend_name);
        let result = backend.read_resource(uri).await?;
        self.audit.record(
            "resources/read",
            Some(&entry.backend_name),
            Some(uri),
            "ok",
            Value::Null,
        );
        Ok(result)
    }

    fn counter_key(server: &str, tool: &str) -> String {
        make_key(server, tool)
    }

    fn note_success(&self, server: &str, tool: &str) {
        if let Some(counter) = self.failures.get(&Self::counter_key(server, tool)) {
            counter.0.store(0, Ordering::Relaxed);
        }
    }

    /// Increment the consecutive-transport-failure counter for a tool and
    /// auto-quarantine it once the threshold is crossed: disable it in the
    /// registry and persist the deny-list state so the quarantine survives
    /// a restart.
    async fn note_transport_failure(&self, server: &str, tool: &str) {
        let key = Self::counter_key(server, tool);
        let count = {
            let counter = self
                .failures
                .entry(key.clone())
                .or_insert_with(|| FailureCounter(AtomicU32::new(0)));
            counter.0.fetch_add(1, Ordering::Relaxed) + 1
        };

        if count == self.quarantine_threshold {
            warn!(backend = %server, tool = %tool, failures = count, "auto-quarantining tool after repeated transport failures");
            self.registry.toggle_tool(server, tool, false);
            crate::cache::save(&self.cache_path, &self.registry).await;
            self.audit.record(
                "tools/quarantine",
                Some(server),
                Some(tool),
                "quarantined",
                serde_json::json!({"consecutive_failures": count}),
            );
        }
    }

    /// Reset a tool's failure counter and re-enable it (admin action).
    pub fn reinstate(&self, server: &str, tool: &str) {
        self.failures.remove(&Self::counter_key(server, tool));
        self.registry.toggle_tool(server, tool, true);
        info!(backend = %server, tool = %tool, "tool reinstated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_matches_registry_key() {
        assert_eq!(RequestRouter::counter_key("exa", "web_search"), "exa__web_search");
    }
}
