use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once.
///
/// Must be called early in `main()` before spawning concurrent tasks.
/// Uses `Once` to guarantee single execution — safe to call multiple times
/// but only the first call has any effect. Subsequent calls (e.g., from
/// hot-reload) are no-ops, preventing UB from `set_var` in multi-threaded context.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: runs at most once, before any user task is spawned.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Custom cache file location. Default: ~/.config/multi-mcp/servers.json
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Global circuit-breaker quarantine threshold (consecutive transport
    /// failures). Per-backend override via `BackendConfig.quarantine_threshold`.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,

    /// Path to the audit log (JSONL). Default: ~/.config/multi-mcp/audit.jsonl
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,

    /// SSRF allow-policy applied to HTTP/SSE backend URLs before connecting.
    #[serde(default)]
    pub ssrf: crate::ssrf::SsrfConfig,
}

/// Secrets resolution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub strict: bool,
}

/// Tool allow/deny filter, accepted in config as either a bare list (shorthand
/// for an allow-list) or an explicit `{allow, deny}` map. `deny` wins; `"*"` is
/// a wildcard in either list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(from = "ToolFilterShape", into = "ToolFilterShape")]
pub struct ToolFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ToolFilterShape {
    Bare(Vec<String>),
    Map {
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        deny: Vec<String>,
    },
}

impl From<ToolFilterShape> for ToolFilter {
    fn from(shape: ToolFilterShape) -> Self {
        match shape {
            ToolFilterShape::Bare(allow) => ToolFilter {
                allow,
                deny: Vec::new(),
            },
            ToolFilterShape::Map { allow, deny } => ToolFilter { allow, deny },
        }
    }
}

impl From<ToolFilter> for ToolFilterShape {
    fn from(f: ToolFilter) -> Self {
        ToolFilterShape::Map {
            allow: f.allow,
            deny: f.deny,
        }
    }
}

impl ToolFilter {
    /// Whether `tool` passes this filter. Deny takes precedence over allow;
    /// `"*"` in either list matches everything. An empty allow-list with a
    /// non-empty deny list still allows everything not denied; an explicit
    /// empty allow-list set via config means "deny all" only when paired with
    /// `"*"` in deny or by the caller treating an empty registry-visible set
    /// as the all-deny state (see State Cache `enabled_tools`).
    pub fn is_allowed(&self, tool: &str) -> bool {
        if self.deny.iter().any(|d| d == "*" || d == tool) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|a| a == "*" || a == tool)
    }
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Explicit transport hint. `None` means auto-detect for URL backends
    /// (try streamable-HTTP, fall back to SSE).
    #[serde(default)]
    pub transport: Option<Transport>,

    /// Custom namespace prefix for tools from this backend.
    /// Default: the backend's YAML key name.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Command to spawn (stdio backends).
    pub command: Option<String>,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables passed to the child process (merged on top of
    /// the scrubbed parent environment).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process.
    pub cwd: Option<String>,

    /// URL for HTTP-reachable backends.
    pub url: Option<String>,

    /// HTTP headers for HTTP-reachable backends.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout.
    #[serde(default = "default_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// Allow/deny filter for tools exposed by this backend.
    #[serde(default)]
    pub tools: Option<ToolFilter>,

    /// Eagerly connected at startup and watchdog-reconnected. Default: false
    /// (lazy — connects on first tool call, idles out after `idle_timeout`).
    #[serde(default)]
    pub always_on: bool,

    /// Idle timeout before a lazy session is disconnected. Default: 10m.
    #[serde(default = "default_idle_timeout", with = "humantime_duration")]
    pub idle_timeout: Duration,

    /// Keywords that, if present in an incoming tool call's text, lazily
    /// enable this backend even before it is directly addressed.
    #[serde(default)]
    pub triggers: Vec<String>,

    /// Per-backend retry configuration for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Rate limit: max calls per time window. None = no rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Per-backend override of the global circuit-breaker quarantine threshold.
    #[serde(default)]
    pub quarantine_threshold: Option<u32>,
}

/// Per-backend retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay", with = "humantime_duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "humantime_duration")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_retry_initial_delay(),
            max_delay: default_retry_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Rate limiting configuration: max calls per time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    #[serde(default = "default_rate_window", with = "humantime_duration")]
    pub window: Duration,
}

/// Transport type for a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
    /// Accepted for compatibility with `{type: "http"}` source configs; treated
    /// identically to `streamable-http`.
    #[serde(rename = "http")]
    Http,
}

/// Global health/session-lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the idle-disconnect sweep runs. Default: 60s (spec §5).
    #[serde(default = "default_idle_sweep_interval", with = "humantime_duration")]
    pub idle_sweep_interval: Duration,

    /// How often the always-on watchdog runs. Default: 30s (spec §5).
    #[serde(default = "default_watchdog_interval", with = "humantime_duration")]
    pub watchdog_interval: Duration,

    /// Deadline for a single connect attempt (transport connect + MCP
    /// initialize handshake). Default: 30s (spec §4.1/§5).
    #[serde(default = "default_connect_deadline", with = "humantime_duration")]
    pub connect_deadline: Duration,

    /// Maximum number of simultaneous in-flight connect attempts across all
    /// backends. Default: 10 (spec §4.1).
    #[serde(default = "default_connection_semaphore")]
    pub connection_semaphore: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval: default_idle_sweep_interval(),
            watchdog_interval: default_watchdog_interval(),
            connect_deadline: default_connect_deadline(),
            connection_semaphore: default_connection_semaphore(),
        }
    }
}

/// Admin HTTP API configuration. The admin surface is always mounted
/// alongside the HTTP+SSE transport (never feature-gated); `api_key` governs
/// whether bearer-token auth is enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Shared bearer token. Empty string disables authentication (not
    /// recommended outside local development).
    #[serde(default)]
    pub api_key: String,

    /// Reveal error detail in 500 responses. Never enable in production.
    #[serde(default)]
    pub debug: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            debug: false,
        }
    }
}

/// Retrieval pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Tools present in every session's initial active set.
    #[serde(default)]
    pub anchor_tools: Vec<String>,

    /// Number of tools emitted at full-description tier before the summary
    /// tier kicks in.
    #[serde(default = "default_full_description_count")]
    pub full_description_count: usize,

    /// Multiplicative boost for tools whose server matches the query's
    /// namespace hint.
    #[serde(default = "default_namespace_boost")]
    pub namespace_boost: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            anchor_tools: Vec::new(),
            full_description_count: default_full_description_count(),
            namespace_boost: default_namespace_boost(),
        }
    }
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_idle_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_watchdog_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_deadline() -> Duration {
    Duration::from_secs(30)
}
fn default_connection_semaphore() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_initial_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}
fn default_quarantine_threshold() -> u32 {
    3
}
fn default_full_description_count() -> usize {
    3
}
fn default_namespace_boost() -> f64 {
    1.5
}

// --- humantime_duration serde helper ---

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime_format(duration);
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '30s', '5m', '1h'")
            })
        }
    }
}

// --- Loading ---

impl Config {
    /// Load config from a YAML file, performing environment variable
    /// interpolation before parsing.
    ///
    /// Pipeline: read file → shellexpand ${VAR} → deserialize YAML → validate.
    /// Secret resolution (`secretref:`) runs as a separate step via
    /// `resolve_secrets`, since it needs a constructed `SecretResolver`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve `secretref:<provider>:<reference>` patterns across every
    /// backend's command/args/env/url/headers using the given resolver.
    pub fn resolve_secrets(
        &mut self,
        resolver: &crate::secrets::resolver::SecretResolver,
    ) -> Result<()> {
        for (name, backend) in self.backends.iter_mut() {
            resolver
                .resolve_option(&mut backend.command)
                .with_context(|| format!("backend '{name}' command"))?;
            resolver
                .resolve_slice(&mut backend.args)
                .with_context(|| format!("backend '{name}' args"))?;
            resolver
                .resolve_map(&mut backend.env)
                .with_context(|| format!("backend '{name}' env"))?;
            resolver
                .resolve_option(&mut backend.url)
                .with_context(|| format!("backend '{name}' url"))?;
            resolver
                .resolve_map(&mut backend.headers)
                .with_context(|| format!("backend '{name}' headers"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            if name.contains("__") {
                anyhow::bail!(
                    "backend '{name}': server names must not contain the reserved separator '__'"
                );
            }

            match backend.transport {
                Some(Transport::Stdio) => {
                    if backend.command.is_none() {
                        anyhow::bail!("backend '{name}': stdio transport requires 'command' field");
                    }
                }
                Some(Transport::Sse | Transport::StreamableHttp | Transport::Http) => {
                    if backend.url.is_none() {
                        anyhow::bail!("backend '{name}': HTTP transport requires 'url' field");
                    }
                }
                None => {
                    if backend.command.is_none() && backend.url.is_none() {
                        anyhow::bail!(
                            "backend '{name}': must specify either 'command' (stdio) or 'url' (HTTP, auto-detected)"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Diff between old and new configs.
pub struct ConfigDiff {
    pub added: Vec<(String, BackendConfig)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, BackendConfig)>,
}

impl Config {
    /// Compute the diff between this config and a new config.
    pub fn diff_backends(&self, new: &Config) -> ConfigDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (name, new_config) in &new.backends {
            match self.backends.get(name) {
                None => added.push((name.clone(), new_config.clone())),
                Some(old_config) if old_config != new_config => {
                    changed.push((name.clone(), new_config.clone()));
                }
                _ => {}
            }
        }

        for name in self.backends.keys() {
            if !new.backends.contains_key(name) {
                removed.push(name.clone());
            }
        }

        ConfigDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Watch a config file for changes and apply backend diffs to the session
/// manager + capability registry. Runs as a background task until shutdown
/// is notified.
pub async fn watch_config(
    config_path: std::path::PathBuf,
    current_config: Arc<arc_swap::ArcSwap<Config>>,
    sessions: Arc<crate::session::SessionManager>,
    registry: Arc<crate::registry::ToolRegistry>,
    cache_path: std::path::PathBuf,
    resolver: Arc<crate::secrets::resolver::SecretResolver>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info, warn};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        error!(path = %config_path.display(), error = %e, "failed to watch config file");
        return;
    }

    info!(path = %config_path.display(), "config file watcher started");

    let debounce = std::time::Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("config file changed, reloading");

                let mut new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse new config, keeping current");
                        continue;
                    }
                };

                if let Err(e) = new_config.resolve_secrets(&resolver) {
                    error!(error = %e, "failed to resolve secrets in new config, keeping current");
                    continue;
                }

                let old_config = current_config.load();
                let diff = old_config.diff_backends(&new_config);

                let has_changes = !diff.added.is_empty()
                    || !diff.removed.is_empty()
                    || !diff.changed.is_empty();

                if !has_changes {
                    info!("config reloaded, no backend changes detected");
                    current_config.store(Arc::new(new_config));
                    continue;
                }

                info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "applying config changes"
                );

                for name in &diff.removed {
                    sessions.unregister(name).await;
                    registry.unregister(name);
                }

                for (name, new_backend_config) in &diff.changed {
                    sessions.unregister(name).await;
                    registry.unregister(name);
                    sessions.register_pending(name, new_backend_config.clone());
                    if let Err(e) = crate::bootstrap::discover_one(name, &sessions, &registry).await {
                        warn!(backend = %name, error = %e, "failed to re-discover changed backend");
                    }
                }

                for (name, backend_config) in &diff.added {
                    sessions.register_pending(name, backend_config.clone());
                    if let Err(e) = crate::bootstrap::discover_one(name, &sessions, &registry).await {
                        warn!(backend = %name, error = %e, "failed to discover new backend");
                    }
                }

                current_config.store(Arc::new(new_config));
                crate::cache::save(&cache_path, &registry).await;

                info!("config reload complete");
            }
            _ = shutdown.notified() => {
                info!("config watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
backends:
  calc:
    command: calc-server
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.backends.contains_key("calc"));
        assert_eq!(config.backends["calc"].idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_parse_http_backend() {
        let yaml = r#"
backends:
  search:
    url: "https://example.com/mcp"
    transport: streamable-http
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.backends["search"].transport, Some(Transport::StreamableHttp));
    }

    #[test]
    fn test_validate_stdio_missing_command() {
        let yaml = r#"
backends:
  calc:
    transport: stdio
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_double_underscore_name() {
        let yaml = r#"
backends:
  bad__name:
    command: foo
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config {
            log_level: default_log_level(),
            secrets: SecretsConfig::default(),
            backends: HashMap::new(),
            health: HealthConfig::default(),
            admin: AdminConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache_path: None,
            quarantine_threshold: default_quarantine_threshold(),
            audit_log_path: None,
            ssrf: Default::default(),
        };
        assert_eq!(config.quarantine_threshold, 3);
        assert_eq!(config.health.connect_deadline, Duration::from_secs(30));
        assert_eq!(config.health.watchdog_interval, Duration::from_secs(30));
        assert_eq!(config.health.idle_sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_diff_backends() {
        let mut old = Config {
            log_level: default_log_level(),
            secrets: SecretsConfig::default(),
            backends: HashMap::new(),
            health: HealthConfig::default(),
            admin: AdminConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache_path: None,
            quarantine_threshold: 3,
            audit_log_path: None,
            ssrf: Default::default(),
        };
        old.backends.insert(
            "a".to_string(),
            BackendConfig {
                transport: None,
                namespace: None,
                command: Some("a-server".to_string()),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                url: None,
                headers: HashMap::new(),
                timeout: default_timeout(),
                tools: None,
                always_on: false,
                idle_timeout: default_idle_timeout(),
                triggers: vec![],
                retry: RetryConfig::default(),
                rate_limit: None,
                quarantine_threshold: None,
            },
        );

        let mut new = old.clone();
        new.backends.remove("a");
        new.backends.insert(
            "b".to_string(),
            BackendConfig {
                transport: None,
                namespace: None,
                command: Some("b-server".to_string()),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                url: None,
                headers: HashMap::new(),
                timeout: default_timeout(),
                tools: None,
                always_on: false,
                idle_timeout: default_idle_timeout(),
                triggers: vec![],
                retry: RetryConfig::default(),
                rate_limit: None,
                quarantine_threshold: None,
            },
        );

        let diff = old.diff_backends(&new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_tool_filter_bare_list_is_allow() {
        let filter: ToolFilter = serde_yaml_ng::from_str("[foo, bar]").unwrap();
        assert!(filter.is_allowed("foo"));
        assert!(!filter.is_allowed("baz"));
    }

    #[test]
    fn test_tool_filter_deny_wildcard_beats_allow() {
        let filter = ToolFilter {
            allow: vec!["foo".to_string()],
            deny: vec!["*".to_string()],
        };
        assert!(!filter.is_allowed("foo"));
    }

    #[test]
    fn test_tool_filter_empty_allow_allows_all_not_denied() {
        let filter = ToolFilter {
            allow: vec![],
            deny: vec!["bad".to_string()],
        };
        assert!(filter.is_allowed("good"));
        assert!(!filter.is_allowed("bad"));
    }

    #[test]
    fn test_retry_config_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
        assert_eq!(retry.max_retries, 3);
    }

    #[test]
    fn test_custom_retry_parsing() {
        let yaml = r#"
backends:
  calc:
    command: calc-server
    retry:
      max_retries: 5
      initial_delay: "1s"
      max_delay: "10s"
      backoff_multiplier: 3.0
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let retry = &config.backends["calc"].retry;
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limit_config_parsing() {
        let yaml = r#"
backends:
  calc:
    command: calc-server
    rate_limit:
      max_calls: 100
      window: "1m"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let rl = config.backends["calc"].rate_limit.as_ref().unwrap();
        assert_eq!(rl.max_calls, 100);
        assert_eq!(rl.window, Duration::from_secs(60));
    }

    #[test]
    fn test_always_on_and_triggers_parsing() {
        let yaml = r#"
backends:
  search:
    command: search-server
    always_on: true
    idle_timeout: "5m"
    triggers: ["search", "lookup"]
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let b = &config.backends["search"];
        assert!(b.always_on);
        assert_eq!(b.idle_timeout, Duration::from_secs(300));
        assert_eq!(b.triggers, vec!["search".to_string(), "lookup".to_string()]);
    }
}
