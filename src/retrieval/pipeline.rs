use super::assembler::TieredAssembler;
use super::logging::RetrievalLogger;
use super::models::{AssembledTool, Candidate};
use super::ranker::rank;
use super::session_state::SessionStateManager;
use crate::config::RetrievalConfig;
use crate::registry::ToolRegistry;

/// Orchestrates the retrieval pipeline: union the session's monotonic
/// active set with the configured anchor tools, intersect with the live
/// registry, then rank and tier-assemble the result for `tools/list`.
pub struct RetrievalPipeline {
    registry: std::sync::Arc<ToolRegistry>,
    config: RetrievalConfig,
    session_state: SessionStateManager,
    logger: Box<dyn RetrievalLogger>,
}

impl RetrievalPipeline {
    pub fn new(
        registry: std::sync::Arc<ToolRegistry>,
        config: RetrievalConfig,
        logger: Box<dyn RetrievalLogger>,
    ) -> Self {
        let anchor_tools = config.anchor_tools.clone();
        Self {
            registry,
            config,
            session_state: SessionStateManager::new(anchor_tools),
            logger,
        }
    }

    /// Build the tool list for a `tools/list` request. When retrieval is
    /// disabled, returns every enabled entry in the registry, unranked, at
    /// full tier. When enabled, returns only the session's active set
    /// (anchors plus whatever `on_tool_called` has disclosed so far),
    /// ranked and tiered.
    pub fn get_tools_for_list(&self, session_id: &str) -> Vec<AssembledTool> {
        let pool: Vec<(String, crate::registry::ToolEntry)> = self
            .registry
            .all_tools()
            .into_iter()
            .filter(|(_, e)| e.enabled)
            .collect();

        if !self.config.enabled {
            let assembler = TieredAssembler::new(pool.len());
            let candidates = pool.into_iter().map(|(key, entry)| to_candidate(key, entry)).collect();
            let assembled = assembler.assemble(candidates);
            self.logger.on_query(session_id, None, &assembled);
            return assembled;
        }

        let active = self.session_state.active_set(session_id);
        let candidates: Vec<Candidate> = pool
            .into_iter()
            .filter(|(key, _)| active.contains(key))
            .map(|(key, entry)| to_candidate(key, entry))
            .collect();

        let ranked = rank(candidates);
        let assembler = TieredAssembler::new(self.config.full_description_count);
        let assembled = assembler.assemble(ranked);

        self.logger.on_query(session_id, None, &assembled);
        assembled
    }

    /// Record that `tool_key` was called in this session, growing its
    /// active set. Returns `true` if the set grew, so the caller can emit
    /// `list_changed`. Never propagates an error — a failure here must not
    /// break the tool call it's piggybacking on.
    pub fn on_tool_called(&self, session_id: &str, tool_key: &str) -> bool {
        self.session_state.add_tools(session_id, std::slice::from_ref(&tool_key.to_string()))
    }

    pub fn drop_session(&self, session_id: &str) {
        self.session_state.drop_session(session_id);
    }
}

/// Uniform score of 1.0 — there is no free-text query at the `tools/list`
/// entry point, so ranking here only discriminates ties by schema
/// specificity and key, per the passthrough retriever fallback.
fn to_candidate(key: String, entry: crate::registry::ToolEntry) -> Candidate {
    Candidate {
        key,
        name: entry.name,
        backend_name: entry.backend_name,
        description: entry.description,
        input_schema: entry.input_schema,
        score: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::logging::NullLogger;
    use serde_json::json;

    fn registry_with(tools: &[(&str, &str)]) -> std::sync::Arc<ToolRegistry> {
        let reg = ToolRegistry::new();
        for (backend, name) in tools {
            reg.register_tools(backend, vec![(name.to_string(), "d".to_string(), json!({}))]);
        }
        reg
    }

    #[test]
    fn test_disabled_returns_full_catalog() {
        let registry = registry_with(&[("exa", "search"), ("fs", "read")]);
        let pipeline = RetrievalPipeline::new(
            registry,
            RetrievalConfig {
                enabled: false,
                anchor_tools: vec![],
                full_description_count: 3,
                namespace_boost: 1.5,
            },
            Box::new(NullLogger),
        );
        let tools = pipeline.get_tools_for_list("s1");
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn test_enabled_starts_with_anchors_only() {
        let registry = registry_with(&[("exa", "search"), ("fs", "read")]);
        let pipeline = RetrievalPipeline::new(
            registry,
            RetrievalConfig {
                enabled: true,
                anchor_tools: vec!["exa__search".to_string()],
                full_description_count: 3,
                namespace_boost: 1.5,
            },
            Box::new(NullLogger),
        );
        let tools = pipeline.get_tools_for_list("s1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].key, "exa__search");
    }

    #[test]
    fn test_on_tool_called_grows_session_set_and_reflects_in_next_list() {
        let registry = registry_with(&[("exa", "search"), ("fs", "read")]);
        let pipeline = RetrievalPipeline::new(
            registry,
            RetrievalConfig {
                enabled: true,
                anchor_tools: vec![],
                full_description_count: 3,
                namespace_boost: 1.5,
            },
            Box::new(NullLogger),
        );
        assert!(pipeline.get_tools_for_list("s1").is_empty());
        assert!(pipeline.on_tool_called("s1", "fs__read"));
        assert!(!pipeline.on_tool_called("s1", "fs__read"));
        let tools = pipeline.get_tools_for_list("s1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].key, "fs__read");
    }
}
