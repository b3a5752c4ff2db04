pub mod assembler;
pub mod keyword;
pub mod logging;
pub mod models;
pub mod namespace_filter;
pub mod pipeline;
pub mod ranker;
pub mod session_state;

pub use models::{AssembledTool, Candidate};
pub use pipeline::RetrievalPipeline;
