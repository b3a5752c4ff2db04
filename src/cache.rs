use crate::registry::{ServerDescriptor, ToolEntry, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default cache path: `~/.config/multimcp-gateway/servers.yaml`.
pub fn default_cache_path() -> PathBuf {
    crate::cli::config_home().join("servers.yaml")
}

#[derive(Serialize, Deserialize, Default)]
struct CachedTool {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Default)]
struct CachedServer {
    #[serde(flatten)]
    descriptor: ServerDescriptor,
    #[serde(default)]
    tools: HashMap<String, CachedTool>,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    #[serde(default)]
    servers: HashMap<String, CachedServer>,
}

/// Load cached server descriptors and tool state into the registry.
/// Only backends that still appear in `known_backends` have their tools
/// loaded; descriptors for every cached server are restored regardless, so
/// bootstrap can still see servers whose source config file went away.
pub async fn load(path: &Path, registry: &ToolRegistry, known_backends: &[String]) -> usize {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(_) => return 0,
    };

    let state: PersistedState = match serde_yaml_ng::from_str(&data) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "invalid state cache, ignoring");
            return 0;
        }
    };

    let mut total = 0;
    for (name, cached) in state.servers {
        registry.set_descriptor(&name, cached.descriptor);

        if !known_backends.is_empty() && !known_backends.contains(&name) {
            continue;
        }

        let entries: Vec<ToolEntry> = cached
            .tools
            .into_iter()
            .map(|(tool_name, t)| ToolEntry {
                name: tool_name,
                description: t.description,
                backend_name: name.clone(),
                input_schema: t.input_schema.unwrap_or(Value::Null),
                enabled: t.enabled,
                stale: t.stale,
            })
            .collect();
        total += entries.len();
        registry.load_cached_tools(&name, entries);
    }

    info!(tools = total, path = %path.display(), "loaded state cache");
    total
}

/// Save the current registry (descriptors + tool state) to the cache file,
/// atomically (write to a temp file, then rename).
pub async fn save(path: &Path, registry: &ToolRegistry) {
    let mut servers: HashMap<String, CachedServer> = HashMap::new();

    for (name, descriptor) in registry.all_descriptors() {
        servers.entry(name).or_insert_with(|| CachedServer {
            descriptor,
            tools: HashMap::new(),
        });
    }

    for (_key, entry) in registry.all_tools() {
        let server = servers.entry(entry.backend_name.clone()).or_default();
        server.tools.insert(
            entry.name.clone(),
            CachedTool {
                enabled: entry.enabled,
                stale: entry.stale,
                description: entry.description,
                input_schema: Some(entry.input_schema),
            },
        );
    }

    let state = PersistedState { servers };

    let yaml = match serde_yaml_ng::to_string(&state) {
        Ok(y) => y,
        Err(e) => {
            warn!(error = %e, "failed to serialize state cache");
            return;
        }
    };

    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %e, dir = %parent.display(), "failed to create cache directory");
        return;
    }

    let tmp = path.with_extension("yaml.tmp");
    if let Err(e) = tokio::fs::write(&tmp, &yaml).await {
        warn!(error = %e, "failed to write state cache temp file");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(error = %e, "failed to rename state cache file");
        return;
    }

    debug!(path = %path.display(), servers = state.servers.len(), "state cache saved");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_sample(registry: &ToolRegistry) {
        registry.set_descriptor(
            "exa",
            ServerDescriptor {
                command: Some("exa-server".to_string()),
                args: vec![],
                env: HashMap::new(),
                url: None,
                transport: Some("stdio".to_string()),
                always_on: false,
                idle_timeout_minutes: Some(10),
            },
        );
        registry.register_tools(
            "exa",
            vec![(
                "web_search".to_string(),
                "Search the web".to_string(),
                serde_json::json!({"type": "object"}),
            )],
        );
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("servers.yaml");

        let registry = ToolRegistry::new();
        register_sample(&registry);

        save(&cache_path, &registry).await;
        assert!(cache_path.exists());

        let registry2 = ToolRegistry::new();
        let loaded = load(&cache_path, &registry2, &["exa".to_string()]).await;
        assert_eq!(loaded, 1);

        let entry = registry2.get_tool("exa__web_search").unwrap();
        assert_eq!(entry.description, "Search the web");
        assert!(entry.stale);

        let descriptor = registry2.get_descriptor("exa").unwrap();
        assert_eq!(descriptor.command.as_deref(), Some("exa-server"));
        assert_eq!(descriptor.idle_timeout_minutes, Some(10));
    }

    #[tokio::test]
    async fn test_load_filters_tools_by_known_backends_but_keeps_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("servers.yaml");

        let registry = ToolRegistry::new();
        register_sample(&registry);
        save(&cache_path, &registry).await;

        let registry2 = ToolRegistry::new();
        let loaded = load(&cache_path, &registry2, &["other".to_string()]).await;
        assert_eq!(loaded, 0);
        // descriptor still recovered for bootstrap purposes
        assert!(registry2.get_descriptor("exa").is_some());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let registry = ToolRegistry::new();
        let loaded = load(Path::new("/nonexistent/servers.yaml"), &registry, &[]).await;
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("servers.yaml");
        tokio::fs::write(&cache_path, "not: valid: yaml: [").await.unwrap();

        let registry = ToolRegistry::new();
        let loaded = load(&cache_path, &registry, &[]).await;
        assert_eq!(loaded, 0);
    }
}
