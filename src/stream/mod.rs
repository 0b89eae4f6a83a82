pub mod buffer;
pub mod decoder;
pub mod driver;
pub mod sse;
pub mod tags;

pub use decoder::StreamDecoder;
pub use driver::drive_stream;
pub use sse::SseParser;

use serde::Serialize;

use crate::protocol::wire::UsageMetadata;

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Consumer-facing event produced while decoding a response stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        id: String,
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        payload: serde_json::Value,
    },
}

/// Outcome of one completed streamed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub event_count: usize,
    pub tool_calls: usize,
    pub account_id: String,
    pub endpoint: String,
    pub attempts: u32,
}
