pub mod parser;
pub mod signature_cache;
pub mod tracker;

pub use parser::ParsedToolCall;
pub use signature_cache::{SignatureCache, PLACEHOLDER_SIGNATURE};
pub use tracker::{ToolCallRecord, ToolCallTracker};
