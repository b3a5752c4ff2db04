use super::models::AssembledTool;

/// Observability seam for the retrieval pipeline — swappable so tests can
/// assert on what was surfaced without scraping log output.
pub trait RetrievalLogger: Send + Sync {
    fn on_query(&self, query: &str, namespace_hint: Option<&str>, returned: &[AssembledTool]);
}

pub struct NullLogger;

impl RetrievalLogger for NullLogger {
    fn on_query(&self, _query: &str, _namespace_hint: Option<&str>, _returned: &[AssembledTool]) {}
}

pub struct TracingLogger;

impl RetrievalLogger for TracingLogger {
    fn on_query(&self, query: &str, namespace_hint: Option<&str>, returned: &[AssembledTool]) {
        tracing::debug!(
            query,
            namespace_hint,
            results = returned.len(),
            keys = ?returned.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(),
            "retrieval pipeline query"
        );
    }
}
