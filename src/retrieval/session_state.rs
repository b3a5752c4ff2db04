use dashmap::DashMap;
use std::collections::HashSet;

/// Per-session active tool-key set for the retrieval pipeline.
///
/// On first access for a session the set is seeded with the configured
/// anchor tools. `add_tools` only ever grows the set — there is
/// deliberately no removal API, so once a tool has appeared in a session's
/// `tools/list` it keeps appearing, preventing an upstream LLM from
/// hallucinating about a tool that silently vanished.
pub struct SessionStateManager {
    active: DashMap<String, HashSet<String>>,
    anchor_tools: Vec<String>,
}

impl SessionStateManager {
    pub fn new(anchor_tools: Vec<String>) -> Self {
        Self {
            active: DashMap::new(),
            anchor_tools,
        }
    }

    /// The session's current active key set, initializing it with the
    /// anchor tools if this is the session's first access.
    pub fn active_set(&self, session_id: &str) -> HashSet<String> {
        self.active
            .entry(session_id.to_string())
            .or_insert_with(|| self.anchor_tools.iter().cloned().collect())
            .clone()
    }

    /// Add keys to the session's active set. Monotonic: never removes.
    /// Returns `true` if the set grew (at least one key was new).
    pub fn add_tools(&self, session_id: &str, keys: &[String]) -> bool {
        let mut entry = self
            .active
            .entry(session_id.to_string())
            .or_insert_with(|| self.anchor_tools.iter().cloned().collect());
        let mut grew = false;
        for key in keys {
            if entry.insert(key.clone()) {
                grew = true;
            }
        }
        grew
    }

    pub fn drop_session(&self, session_id: &str) {
        self.active.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeds_with_anchor_tools_on_first_access() {
        let mgr = SessionStateManager::new(vec!["exa__search".to_string()]);
        let set = mgr.active_set("s1");
        assert!(set.contains("exa__search"));
    }

    #[test]
    fn test_add_tools_is_monotonic() {
        let mgr = SessionStateManager::new(vec![]);
        assert!(mgr.add_tools("s1", &["a".to_string()]));
        assert!(!mgr.add_tools("s1", &["a".to_string()]));
        assert!(mgr.add_tools("s1", &["a".to_string(), "b".to_string()]));
        let set = mgr.active_set("s1");
        assert!(set.contains("a"));
        assert!(set.contains("b"));
    }

    #[test]
    fn test_drop_session_clears_state() {
        let mgr = SessionStateManager::new(vec![]);
        mgr.add_tools("s1", &["a".to_string()]);
        mgr.drop_session("s1");
        assert!(!mgr.active_set("s1").contains("a"));
    }
}
