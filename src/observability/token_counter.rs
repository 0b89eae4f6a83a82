use crate::protocol::conversation::{ChatRequest, ContentPart};
use crate::protocol::wire::UsageMetadata;
use std::time::Duration;
use tracing::{info, warn};

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate the total input tokens for a chat request.
///
/// Sums tokens from turn text, stored thinking, tool calls, tool results and
/// serialized tool declarations.
#[must_use]
pub fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    let mut total: u64 = 0;

    for turn in &request.turns {
        if let Some(thinking) = turn.thinking.as_deref() {
            total += estimate_tokens(thinking);
        }
        for part in &turn.parts {
            match part {
                ContentPart::Text { text } => total += estimate_tokens(text),
                ContentPart::ToolResult { payload, .. } => total += estimate_tokens(payload),
                ContentPart::ToolCall { name, args, .. } => {
                    total += estimate_tokens(name);
                    total += estimate_tokens(&args.to_string());
                }
                // Images are not counted via text tokenization
                ContentPart::Image { .. } => {}
            }
        }
    }

    for tool in &request.tools {
        total += estimate_tokens(&tool.name);
        if let Some(description) = tool.description.as_deref() {
            total += estimate_tokens(description);
        }
        if let Ok(serialized) = serde_json::to_string(&tool.parameters) {
            total += estimate_tokens(&serialized);
        }
    }

    total
}

/// Warn when the estimated input exceeds the model's input limit. Returns the
/// estimate.
pub fn check_input_budget(request: &ChatRequest, max_input_tokens: Option<u64>) -> u64 {
    let estimated = estimate_request_tokens(request);
    if let Some(limit) = max_input_tokens {
        if estimated > limit {
            warn!(
                model = %request.model,
                estimated_input_tokens = estimated,
                max_input_tokens = limit,
                "request likely exceeds the model input limit"
            );
        }
    }
    estimated
}

/// Log token usage for a completed stream at INFO level.
///
/// Falls back to `estimated_input` when the upstream reported no prompt
/// count.
pub fn log_stream_usage(
    model: &str,
    usage: Option<&UsageMetadata>,
    estimated_input: u64,
    duration: Duration,
) {
    let input_tokens = usage
        .and_then(|u| u.prompt_token_count)
        .filter(|v| *v > 0)
        .unwrap_or(estimated_input);
    let output_tokens = usage.and_then(|u| u.candidates_token_count).unwrap_or(0);
    let thinking_tokens = usage.and_then(|u| u.thoughts_token_count).unwrap_or(0);
    let total_tokens = usage
        .and_then(|u| u.total_token_count)
        .filter(|v| *v > 0)
        .unwrap_or(input_tokens + output_tokens + thinking_tokens);
    info!(
        model = model,
        input_tokens,
        output_tokens,
        thinking_tokens,
        total_tokens,
        reported = usage.is_some(),
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
