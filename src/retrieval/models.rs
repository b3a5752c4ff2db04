use serde_json::Value;

/// A tool candidate going through the retrieval pipeline, before tiered
/// description compression is applied.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    pub name: String,
    pub backend_name: String,
    pub description: String,
    pub input_schema: Value,
    pub score: f64,
}

/// A tool as it will be announced to the client: either full tier (verbatim
/// description + schema) or summary tier (truncated description + schema
/// with every nested `description` field stripped).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AssembledTool {
    pub key: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}
