use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::backend;
use crate::config::Config;
use crate::registry::{ServerDescriptor, ToolRegistry};
use crate::session::SessionManager;

/// Idempotent startup discovery: load the state cache so the catalog is
/// populated before any backend connects, register every configured backend
/// as pending, then eagerly connect the `always_on` ones. Lazy backends are
/// left pending and connect on first use via the session manager.
///
/// Safe to call more than once for the same backend (re-discovery after a
/// config hot-reload) since `register_pending` and `registry.register_*` are
/// both idempotent/overwrite-consistent.
pub async fn discover_all(
    config: &Config,
    sessions: &Arc<SessionManager>,
    registry: &Arc<ToolRegistry>,
    cache_path: &std::path::Path,
) -> Result<()> {
    let known_backends: Vec<String> = config.backends.keys().cloned().collect();
    let cached = crate::cache::load(cache_path, registry, &known_backends).await;
    if cached > 0 {
        info!(tools = cached, "tools available from cache before any backend connects");
    }

    for (name, backend_config) in &config.backends {
        sessions.register_pending(name, backend_config.clone());
        registry.set_descriptor(name, descriptor_from_config(backend_config));
    }

    let always_on: Vec<String> = config
        .backends
        .iter()
        .filter(|(_, c)| c.always_on)
        .map(|(name, _)| name.clone())
        .collect();

    for name in always_on {
        if let Err(e) = discover_one(&name, sessions, registry).await {
            warn!(backend = %name, error = %e, "failed to eagerly connect always-on backend at startup");
        }
    }

    crate::cache::save(cache_path, registry).await;

    info!(
        tools = registry.tool_count(),
        backends = config.backends.len(),
        "bootstrap discovery complete"
    );

    Ok(())
}

/// Connect a single backend (if not already connected) and register its
/// discovered tools/prompts/resources. Used both by `discover_all` for
/// always-on backends and by `config::watch_config` for newly-added or
/// changed backends — both paths must funnel through the same
/// `backend::connect()` so transport selection never diverges between
/// startup and hot-reload.
pub async fn discover_one(
    name: &str,
    sessions: &Arc<SessionManager>,
    registry: &Arc<ToolRegistry>,
) -> Result<()> {
    let backend = sessions.get_or_create(name).await?;

    let mut tools = backend.discover_tools().await?;
    if let Some(filter) = sessions.backend_config(name).and_then(|c| c.tools) {
        tools.retain(|(tool_name, _, _)| filter.is_allowed(tool_name));
    }
    registry.register_tools(name, tools);

    let prompts = backend.discover_prompts().await.unwrap_or_default();
    registry.register_prompts(name, prompts);

    let resources = backend.discover_resources().await.unwrap_or_default();
    registry.register_resources(name, resources);

    info!(backend = name, tools = registry.tools_for_backend(name).len(), "backend discovered");

    Ok(())
}

pub(crate) fn descriptor_from_config(config: &crate::config::BackendConfig) -> ServerDescriptor {
    ServerDescriptor {
        command: config.command.clone(),
        args: config.args.clone(),
        env: config.env.clone(),
        url: config.url.clone(),
        transport: config.transport.map(|t| match t {
            crate::config::Transport::Stdio => "stdio".to_string(),
            crate::config::Transport::Sse => "sse".to_string(),
            crate::config::Transport::StreamableHttp => "streamable-http".to_string(),
            crate::config::Transport::Http => "http".to_string(),
        }),
        always_on: config.always_on,
        idle_timeout_minutes: Some(config.idle_timeout.as_secs() / 60),
    }
}

/// Lazily connect every backend whose configured `triggers` keyword list
/// matches, used once at startup to pre-warm obviously-relevant backends
/// before the first client request (distinct from `trigger::TriggerManager`,
/// which does the same thing per-message at runtime).
pub async fn prewarm_matching(
    keywords: &[String],
    sessions: &Arc<SessionManager>,
    registry: &Arc<ToolRegistry>,
) {
    let configs = sessions.all_pending_configs();
    for (name, config) in configs {
        if sessions.is_connected(&name) {
            continue;
        }
        let matched = config
            .triggers
            .iter()
            .any(|t| keywords.iter().any(|k| k.eq_ignore_ascii_case(t)));
        if matched && let Err(e) = discover_one(&name, sessions, registry).await {
            warn!(backend = %name, error = %e, "prewarm connect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RetryConfig};
    use std::collections::HashMap;
    use std::time::Duration;

    fn backend_config(command: &str) -> BackendConfig {
        BackendConfig {
            transport: None,
            namespace: None,
            command: Some(command.to_string()),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            tools: None,
            always_on: false,
            idle_timeout: Duration::from_secs(600),
            triggers: vec!["search".to_string()],
            retry: RetryConfig::default(),
            rate_limit: None,
            quarantine_threshold: None,
        }
    }

    #[test]
    fn test_descriptor_from_config_roundtrips_transport() {
        let mut config = backend_config("exa-server");
        config.transport = Some(crate::config::Transport::Stdio);
        let descriptor = descriptor_from_config(&config);
        assert_eq!(descriptor.transport.as_deref(), Some("stdio"));
        assert_eq!(descriptor.command.as_deref(), Some("exa-server"));
    }

    #[tokio::test]
    async fn test_discover_all_registers_pending_backends() {
        let mut config = Config {
            log_level: "info".to_string(),
            secrets: Default::default(),
            backends: HashMap::new(),
            health: Default::default(),
            admin: Default::default(),
            retrieval: Default::default(),
            cache_path: None,
            quarantine_threshold: 3,
            audit_log_path: None,
            ssrf: Default::default(),
        };
        config.backends.insert("exa".to_string(), backend_config("exa-server"));

        let sessions = SessionManager::new(10, Duration::from_secs(1), |_| {});
        let registry = ToolRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("servers.yaml");

        // always_on is false, so no connect attempt should be made — this
        // must not error or hang even with no real backend process available.
        discover_all(&config, &sessions, &registry, &cache_path).await.unwrap();

        assert!(sessions.pending_names().contains(&"exa".to_string()));
        assert!(registry.get_descriptor("exa").is_some());
    }
}
