use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Separator between a backend's namespace and the item's raw name in a
/// capability key. Backend/server names must never contain this sequence.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build a namespaced capability key from a server name and a raw item name.
pub fn make_key(server: &str, item: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{item}")
}

/// Split a namespaced capability key back into (server, item), splitting on
/// the *first* occurrence of the separator (server names themselves are
/// guaranteed `__`-free at config-validation time, but tool names are not).
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(NAMESPACE_SEPARATOR)
}

/// A tool entry in the capability registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    /// Raw tool name as reported by the backend (unnamespaced).
    pub name: String,
    pub description: String,
    pub backend_name: String,
    pub input_schema: Value,
    /// Disabled by admin action or by circuit-breaker auto-quarantine.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// True when this entry was loaded from the persisted cache and has not
    /// yet been reconfirmed against a live backend connection.
    #[serde(default)]
    pub stale: bool,
}

fn default_true() -> bool {
    true
}

/// A prompt entry in the capability registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Value,
    pub backend_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stale: bool,
}

/// A resource entry in the capability registry. Resource URIs are stored
/// *raw* — they are never namespaced, since MCP resource URIs are already
/// globally-scoped (e.g. `file:///...`, `https://...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub backend_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stale: bool,
}

/// Concurrent capability registry aggregating tools, prompts, and resources
/// from every configured backend behind a single namespaced catalog.
///
/// Reads are lock-free (`DashMap` shard locking only); mutation paths
/// (register/unregister/toggle) briefly lock the affected shard.
/// Connection descriptor for a backend, as persisted in the state cache.
/// Mirrors the subset of `BackendConfig` needed to reconstruct a connection
/// without the original source config file (used by bootstrap to recover
/// after a source config disappears, and to round-trip the cache schema).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDescriptor {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub transport: Option<String>,
    #[serde(default)]
    pub always_on: bool,
    pub idle_timeout_minutes: Option<u64>,
}

pub struct ToolRegistry {
    /// Live, routable tools — exactly the set `tools/list` and `tools/call`
    /// see. A disabled tool is absent here, never merely flagged.
    tools: DashMap<String, ToolEntry>,
    /// Deny-listed tools: admin-disabled or circuit-breaker-quarantined.
    /// Kept around (rather than dropped) so cache persistence and admin
    /// listing can still see them, and so `toggle_tool(enabled: true)` can
    /// restore the entry without waiting for the backend to re-announce it.
    disabled_tools: DashMap<String, ToolEntry>,
    prompts: DashMap<String, PromptEntry>,
    resources: DashMap<String, ResourceEntry>,

    backend_tool_keys: DashMap<String, Vec<String>>,
    backend_prompt_keys: DashMap<String, Vec<String>>,
    backend_resource_uris: DashMap<String, Vec<String>>,
    descriptors: DashMap<String, ServerDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: DashMap::new(),
            disabled_tools: DashMap::new(),
            prompts: DashMap::new(),
            resources: DashMap::new(),
            backend_tool_keys: DashMap::new(),
            backend_prompt_keys: DashMap::new(),
            backend_resource_uris: DashMap::new(),
            descriptors: DashMap::new(),
        })
    }

    pub fn set_descriptor(&self, backend_name: &str, descriptor: ServerDescriptor) {
        self.descriptors.insert(backend_name.to_string(), descriptor);
    }

    pub fn get_descriptor(&self, backend_name: &str) -> Option<ServerDescriptor> {
        self.descriptors.get(backend_name).map(|r| r.value().clone())
    }

    pub fn all_descriptors(&self) -> Vec<(String, ServerDescriptor)> {
        self.descriptors.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }

    // --- Tools ---

    /// Replace a backend's tool set with freshly discovered entries.
    ///
    /// Deny-listed state is preserved across re-registration: a tool that is
    /// currently admin-disabled or quarantined stays out of the live `tools`
    /// map (and so absent from `tools/list`/`tools/call`) when the backend
    /// reconnects and re-announces the same tool name — only its cached
    /// description/schema in `disabled_tools` is refreshed.
    pub fn register_tools(&self, backend_name: &str, discovered: Vec<(String, String, Value)>) {
        let mut keys = Vec::with_capacity(discovered.len());
        for (name, description, input_schema) in discovered {
            let key = make_key(backend_name, &name);
            let entry = ToolEntry {
                name,
                description,
                backend_name: backend_name.to_string(),
                input_schema,
                enabled: !self.disabled_tools.contains_key(&key),
                stale: false,
            };
            if entry.enabled {
                self.tools.insert(key.clone(), entry);
            } else {
                self.disabled_tools.insert(key.clone(), entry);
            }
            keys.push(key);
        }
        if let Some(old_keys) = self.backend_tool_keys.insert(backend_name.to_string(), keys.clone()) {
            for old_key in old_keys {
                if !keys.contains(&old_key) {
                    self.tools.remove(&old_key);
                    self.disabled_tools.remove(&old_key);
                }
            }
        }
    }

    /// Insert tool entries loaded from the persisted cache at startup,
    /// marked stale until the owning backend connects and reconfirms them.
    /// Entries cached as disabled go straight into the deny-list, not the
    /// live table.
    pub fn load_cached_tools(&self, backend_name: &str, entries: Vec<ToolEntry>) {
        let mut keys = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.stale = true;
            let key = make_key(backend_name, &entry.name);
            keys.push(key.clone());
            if entry.enabled {
                self.tools.insert(key, entry);
            } else {
                self.disabled_tools.insert(key, entry);
            }
        }
        self.backend_tool_keys.insert(backend_name.to_string(), keys);
    }

    /// Look up a *live* tool. Returns `None` for a disabled/quarantined
    /// tool just as it would for a tool that was never registered — callers
    /// must not be able to distinguish "unknown" from "denied".
    pub fn get_tool(&self, key: &str) -> Option<ToolEntry> {
        self.tools.get(key).map(|r| r.value().clone())
    }

    /// Every known tool, live or deny-listed — used for cache persistence
    /// and admin listing, where a quarantined tool still needs to be visible
    /// and reinstatable.
    pub fn all_tools(&self) -> Vec<(String, ToolEntry)> {
        self.tools
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .chain(self.disabled_tools.iter().map(|r| (r.key().clone(), r.value().clone())))
            .collect()
    }

    pub fn tools_for_backend(&self, backend_name: &str) -> Vec<(String, ToolEntry)> {
        self.backend_tool_keys
            .get(backend_name)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| {
                        self.tools
                            .get(k)
                            .or_else(|| self.disabled_tools.get(k))
                            .map(|r| (k.clone(), r.value().clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Enable/disable a single tool (admin action or circuit-breaker
    /// quarantine). Disabling removes the key from the live `tools` map
    /// entirely (spec Invariant: quarantined tools are absent from
    /// `tool_to_server`) and moves the entry to the deny-list; enabling
    /// reverses that. Returns `false` if the key is unknown altogether.
    pub fn toggle_tool(&self, backend_name: &str, tool_name: &str, enabled: bool) -> bool {
        let key = make_key(backend_name, tool_name);
        if enabled {
            if let Some((_, mut entry)) = self.disabled_tools.remove(&key) {
                entry.enabled = true;
                self.tools.insert(key, entry);
                true
            } else if let Some(mut entry) = self.tools.get_mut(&key) {
                entry.enabled = true;
                true
            } else {
                false
            }
        } else if let Some((_, mut entry)) = self.tools.remove(&key) {
            entry.enabled = false;
            self.disabled_tools.insert(key, entry);
            true
        } else {
            self.disabled_tools.contains_key(&key)
        }
    }

    // --- Prompts ---

    pub fn register_prompts(&self, backend_name: &str, discovered: Vec<(String, Option<String>, Value)>) {
        let mut keys = Vec::with_capacity(discovered.len());
        for (name, description, arguments) in discovered {
            let key = make_key(backend_name, &name);
            let enabled = self.prompts.get(&key).map(|e| e.enabled).unwrap_or(true);
            self.prompts.insert(
                key.clone(),
                PromptEntry {
                    name,
                    description,
                    arguments,
                    backend_name: backend_name.to_string(),
                    enabled,
                    stale: false,
                },
            );
            keys.push(key);
        }
        if let Some(old_keys) = self.backend_prompt_keys.insert(backend_name.to_string(), keys.clone()) {
            for old_key in old_keys {
                if !keys.contains(&old_key) {
                    self.prompts.remove(&old_key);
                }
            }
        }
    }

    pub fn get_prompt(&self, key: &str) -> Option<PromptEntry> {
        self.prompts.get(key).map(|r| r.value().clone())
    }

    pub fn all_prompts(&self) -> Vec<(String, PromptEntry)> {
        self.prompts.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }

    // --- Resources ---

    pub fn register_resources(
        &self,
        backend_name: &str,
        discovered: Vec<(String, Option<String>, Option<String>, Option<String>)>,
    ) {
        let mut uris = Vec::with_capacity(discovered.len());
        for (uri, name, description, mime_type) in discovered {
            let enabled = self.resources.get(&uri).map(|e| e.enabled).unwrap_or(true);
            self.resources.insert(
                uri.clone(),
                ResourceEntry {
                    uri: uri.clone(),
                    name,
                    description,
                    mime_type,
                    backend_name: backend_name.to_string(),
                    enabled,
                    stale: false,
                },
            );
            uris.push(uri);
        }
        if let Some(old_uris) = self.backend_resource_uris.insert(backend_name.to_string(), uris.clone()) {
            for old_uri in old_uris {
                if !uris.contains(&old_uri) {
                    self.resources.remove(&old_uri);
                }
            }
        }
    }

    pub fn get_resource(&self, uri: &str) -> Option<ResourceEntry> {
        self.resources.get(uri).map(|r| r.value().clone())
    }

    pub fn all_resources(&self) -> Vec<ResourceEntry> {
        self.resources.iter().map(|r| r.value().clone()).collect()
    }

    // --- Lifecycle ---

    /// Mark every capability owned by `backend_name` as stale, without
    /// removing it from the catalog — used when a lazy session idles out or
    /// an always-on backend temporarily drops, so clients still see the last
    /// known tool list rather than a hole in the catalog.
    pub fn mark_backend_stale(&self, backend_name: &str) {
        if let Some(keys) = self.backend_tool_keys.get(backend_name) {
            for key in keys.iter() {
                if let Some(mut e) = self.tools.get_mut(key) {
                    e.stale = true;
                } else if let Some(mut e) = self.disabled_tools.get_mut(key) {
                    e.stale = true;
                }
            }
        }
        if let Some(keys) = self.backend_prompt_keys.get(backend_name) {
            for key in keys.iter() {
                if let Some(mut e) = self.prompts.get_mut(key) {
                    e.stale = true;
                }
            }
        }
        if let Some(uris) = self.backend_resource_uris.get(backend_name) {
            for uri in uris.iter() {
                if let Some(mut e) = self.resources.get_mut(uri) {
                    e.stale = true;
                }
            }
        }
    }

    /// Fully remove a backend's capabilities from the catalog — used when the
    /// backend is deleted from config, not merely disconnected.
    pub fn unregister(&self, backend_name: &str) {
        if let Some((_, keys)) = self.backend_tool_keys.remove(backend_name) {
            for key in keys {
                self.tools.remove(&key);
                self.disabled_tools.remove(&key);
            }
        }
        if let Some((_, keys)) = self.backend_prompt_keys.remove(backend_name) {
            for key in keys {
                self.prompts.remove(&key);
            }
        }
        if let Some((_, uris)) = self.backend_resource_uris.remove(backend_name) {
            for uri in uris {
                self.resources.remove(&uri);
            }
        }
        self.descriptors.remove(backend_name);
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backend_tool_keys.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_make_and_split_key() {
        let key = make_key("exa", "web_search");
        assert_eq!(key, "exa__web_search");
        assert_eq!(split_key(&key), Some(("exa", "web_search")));
    }

    #[test]
    fn test_split_key_first_separator_only() {
        // tool name itself containing "__" must not confuse the split.
        let key = make_key("exa", "web__search");
        assert_eq!(split_key(&key), Some(("exa", "web__search")));
    }

    #[test]
    fn test_register_and_get_tool() {
        let reg = ToolRegistry::new();
        reg.register_tools(
            "exa",
            vec![("web_search".to_string(), "Search the web".to_string(), json!({"type": "object"}))],
        );
        assert_eq!(reg.tool_count(), 1);
        let entry = reg.get_tool("exa__web_search").unwrap();
        assert_eq!(entry.backend_name, "exa");
        assert!(entry.enabled);
        assert!(!entry.stale);
    }

    #[test]
    fn test_toggle_preserved_across_reregister() {
        let reg = ToolRegistry::new();
        reg.register_tools(
            "exa",
            vec![("web_search".to_string(), "d".to_string(), json!({}))],
        );
        assert!(reg.toggle_tool("exa", "web_search", false));
        // Disabled: absent from the live routable map entirely.
        assert!(reg.get_tool("exa__web_search").is_none());

        reg.register_tools(
            "exa",
            vec![("web_search".to_string(), "d2".to_string(), json!({}))],
        );
        // Re-announcing the same tool must not reinstate it...
        assert!(reg.get_tool("exa__web_search").is_none());
        // ...but its cached entry (still reachable for admin/cache purposes)
        // reflects the refreshed description.
        let (_, entry) = reg
            .tools_for_backend("exa")
            .into_iter()
            .find(|(k, _)| k == "exa__web_search")
            .unwrap();
        assert!(!entry.enabled);
        assert_eq!(entry.description, "d2");

        assert!(reg.toggle_tool("exa", "web_search", true));
        assert!(reg.get_tool("exa__web_search").unwrap().enabled);
    }

    #[test]
    fn test_toggle_tool_removes_key_from_live_map() {
        let reg = ToolRegistry::new();
        reg.register_tools("exa", vec![("a".to_string(), "d".to_string(), json!({}))]);
        assert!(reg.toggle_tool("exa", "a", false));
        assert!(reg.get_tool("exa__a").is_none());
        assert_eq!(reg.tool_count(), 0);
        // Still visible for cache/admin purposes via all_tools/tools_for_backend.
        assert_eq!(reg.all_tools().len(), 1);
        assert_eq!(reg.tools_for_backend("exa").len(), 1);
    }

    #[test]
    fn test_register_drops_stale_tools_no_longer_present() {
        let reg = ToolRegistry::new();
        reg.register_tools(
            "exa",
            vec![
                ("a".to_string(), "d".to_string(), json!({})),
                ("b".to_string(), "d".to_string(), json!({})),
            ],
        );
        assert_eq!(reg.tool_count(), 2);
        reg.register_tools("exa", vec![("a".to_string(), "d".to_string(), json!({}))]);
        assert_eq!(reg.tool_count(), 1);
        assert!(reg.get_tool("exa__b").is_none());
    }

    #[test]
    fn test_unregister_removes_everything() {
        let reg = ToolRegistry::new();
        reg.register_tools("exa", vec![("a".to_string(), "d".to_string(), json!({}))]);
        reg.register_resources("exa", vec![("file:///a".to_string(), None, None, None)]);
        reg.unregister("exa");
        assert_eq!(reg.tool_count(), 0);
        assert!(reg.all_resources().is_empty());
    }

    #[test]
    fn test_mark_backend_stale() {
        let reg = ToolRegistry::new();
        reg.register_tools("exa", vec![("a".to_string(), "d".to_string(), json!({}))]);
        reg.mark_backend_stale("exa");
        assert!(reg.get_tool("exa__a").unwrap().stale);
    }

    #[test]
    fn test_load_cached_tools_marks_stale() {
        let reg = ToolRegistry::new();
        reg.load_cached_tools(
            "exa",
            vec![ToolEntry {
                name: "a".to_string(),
                description: "d".to_string(),
                backend_name: "exa".to_string(),
                input_schema: json!({}),
                enabled: true,
                stale: false,
            }],
        );
        assert!(reg.get_tool("exa__a").unwrap().stale);
    }

    #[test]
    fn test_resource_uri_not_namespaced() {
        let reg = ToolRegistry::new();
        reg.register_resources(
            "fs",
            vec![("file:///tmp/foo.txt".to_string(), Some("foo".to_string()), None, None)],
        );
        assert!(reg.get_resource("file:///tmp/foo.txt").is_some());
        assert!(reg.get_resource("fs__file:///tmp/foo.txt").is_none());
    }
}
