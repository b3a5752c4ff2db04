use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::bootstrap;
use crate::registry::ToolRegistry;
use crate::session::SessionManager;

/// Watches incoming JSON-RPC messages for keywords that should eagerly
/// connect a lazy backend even before it is directly addressed by name —
/// e.g. a user message mentioning "search the web" pre-warms a search
/// backend's session while the model is still deciding which tool to call.
pub struct TriggerManager {
    sessions: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
}

impl TriggerManager {
    pub fn new(sessions: Arc<SessionManager>, registry: Arc<ToolRegistry>) -> Self {
        Self { sessions, registry }
    }

    /// Scan `message` for any pending backend's trigger keywords and connect
    /// every match concurrently before returning. The connects (and
    /// tool/prompt/resource registration) are awaited, not spawned: a caller
    /// that retries a "not found" lookup against the registry right after
    /// `on_message` returns must already see the newly registered tools, or
    /// the whole lazily-enable-on-keyword mechanism is a no-op. Matches run
    /// concurrently rather than one after another so a message that trips
    /// triggers on several independent backends doesn't pay their connect
    /// latency serially. Exceptions from individual connect attempts are
    /// swallowed (logged, not propagated) since triggers are a best-effort
    /// pre-warm, not a correctness requirement.
    pub async fn on_message(&self, message: &Value) {
        let text = extract_strings(message).join(" ").to_lowercase();
        if text.is_empty() {
            return;
        }

        let matches: Vec<String> = self
            .sessions
            .all_pending_configs()
            .into_iter()
            .filter(|(name, config)| {
                !self.sessions.is_connected(name)
                    && config.triggers.iter().any(|kw| text.contains(&kw.to_lowercase()))
            })
            .map(|(name, _)| name)
            .collect();

        let connects = matches.into_iter().map(|name| async move {
            let result = bootstrap::discover_one(&name, &self.sessions, &self.registry).await;
            (name, result)
        });

        for (name, result) in futures::future::join_all(connects).await {
            match result {
                Ok(()) => debug!(backend = %name, "trigger pre-warmed and registered backend"),
                Err(e) => debug!(backend = %name, error = %e, "trigger pre-warm failed"),
            }
        }
    }
}

/// Recursively collect every string value in a JSON structure.
fn extract_strings(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_strings_nested() {
        let value = json!({"params": {"arguments": {"query": "search the web for rust"}}});
        let strings = extract_strings(&value);
        assert!(strings.iter().any(|s| s.contains("search the web")));
    }

    #[test]
    fn test_extract_strings_ignores_numbers_and_bools() {
        let value = json!({"count": 5, "enabled": true, "name": "hello"});
        let strings = extract_strings(&value);
        assert_eq!(strings, vec!["hello".to_string()]);
    }
}
