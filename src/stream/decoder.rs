//! Response stream decoder.
//!
//! Bytes in, [`StreamEvent`]s out. All timing decisions take a logical
//! `Duration` offset so the buffering policy is deterministic; the async
//! driver supplies elapsed wall time.

use std::time::Duration;

use crate::config::StreamConfig;
use crate::fc::tracker::ToolCallTracker;
use crate::json_scan::split_top_level_objects;
use crate::protocol::wire::{parse_chunk, UsageMetadata, WireChunk, WirePart};
use crate::stream::buffer::{TextBuffer, ThinkingBuffer, VelocityMeter};
use crate::stream::sse::{is_done_event, SseParser};
use crate::stream::tags::{TagEvent, TagScanner};
use crate::stream::{SseEvent, StreamEvent, StreamSummary};

pub struct StreamDecoder {
    sse: SseParser,
    sse_events: Vec<SseEvent>,
    tags: TagScanner,
    tag_events: Vec<TagEvent>,
    text: TextBuffer,
    thinking: ThinkingBuffer,
    meter: VelocityMeter,
    tracker: ToolCallTracker,
    velocity_threshold: f64,
    liveness_interval: Duration,
    thinking_block: u32,
    thinking_open: bool,
    last_bytes_at: Duration,
    done: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    model_version: Option<String>,
    events_emitted: usize,
    tool_calls: usize,
}

impl StreamDecoder {
    #[must_use]
    pub fn new(config: &StreamConfig, tracker: ToolCallTracker) -> Self {
        Self {
            sse: SseParser::new(),
            sse_events: Vec::with_capacity(8),
            tags: TagScanner::new(config.max_tag_buffer_bytes),
            tag_events: Vec::with_capacity(8),
            text: TextBuffer::new(
                config.text_min_chars,
                Duration::from_millis(config.text_max_latency_ms),
            ),
            thinking: ThinkingBuffer::new(config.thinking_chunk_chars),
            meter: VelocityMeter::default(),
            tracker,
            velocity_threshold: config.velocity_threshold_bytes_per_ms,
            liveness_interval: Duration::from_millis(config.liveness_interval_ms),
            thinking_block: 0,
            thinking_open: false,
            last_bytes_at: Duration::ZERO,
            done: false,
            finish_reason: None,
            usage: None,
            model_version: None,
            events_emitted: 0,
            tool_calls: 0,
        }
    }

    /// True once the `[DONE]` marker has been seen.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn feed(&mut self, bytes: &[u8], at: Duration, out: &mut Vec<StreamEvent>) {
        self.meter.record(bytes.len(), at);
        self.last_bytes_at = at;
        let mut events = std::mem::take(&mut self.sse_events);
        self.sse.feed_into(bytes, &mut events);
        for event in events.drain(..) {
            self.handle_sse_event(&event, at, out);
        }
        self.sse_events = events;
    }

    /// Timer-driven flushes: text latency, and liveness when the upstream
    /// has been silent for the liveness interval.
    pub fn tick(&mut self, at: Duration, out: &mut Vec<StreamEvent>) {
        self.flush_text_if_due(at, out);
        if at.saturating_sub(self.last_bytes_at) >= self.liveness_interval {
            if let Some(text) = self.thinking.take_all() {
                let id = self.thinking_id();
                self.emit(out, StreamEvent::ThinkingDelta { id, text });
            }
            self.flush_text(at, out);
        }
    }

    /// Force-flush everything at end of stream.
    pub fn finish(&mut self, at: Duration, out: &mut Vec<StreamEvent>) {
        let mut events = std::mem::take(&mut self.sse_events);
        self.sse.finish_into(&mut events);
        for event in events.drain(..) {
            self.handle_sse_event(&event, at, out);
        }
        self.sse_events = events;

        let mut tag_events = std::mem::take(&mut self.tag_events);
        self.tags.finish(&mut tag_events);
        self.apply_tag_events(&mut tag_events, at, out);
        self.tag_events = tag_events;

        self.close_thinking(out);
        self.flush_text(at, out);
    }

    /// Decode-side fields of the request summary.
    #[must_use]
    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            finish_reason: self.finish_reason.clone(),
            usage: self.usage,
            model_version: self.model_version.clone(),
            event_count: self.events_emitted,
            tool_calls: self.tool_calls,
            ..StreamSummary::default()
        }
    }

    fn handle_sse_event(&mut self, event: &SseEvent, at: Duration, out: &mut Vec<StreamEvent>) {
        if self.done {
            return;
        }
        if is_done_event(event) {
            self.done = true;
            return;
        }
        let data = event.data.trim();
        if data.is_empty() {
            return;
        }
        match parse_chunk(data) {
            Ok(chunk) => self.handle_chunk(chunk, at, out),
            Err(err) => {
                let pieces = split_top_level_objects(data.as_bytes());
                if pieces.is_empty() {
                    tracing::warn!(error = %err, bytes = data.len(), "dropping unparseable stream event");
                }
                for range in pieces {
                    match parse_chunk(&data[range]) {
                        Ok(chunk) => self.handle_chunk(chunk, at, out),
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping unparseable stream event fragment");
                        }
                    }
                }
            }
        }
        self.flush_text_if_due(at, out);
    }

    fn handle_chunk(&mut self, chunk: WireChunk, at: Duration, out: &mut Vec<StreamEvent>) {
        if chunk.usage_metadata.is_some() {
            self.usage = chunk.usage_metadata;
        }
        if chunk.model_version.is_some() {
            self.model_version = chunk.model_version;
        }
        for candidate in chunk.candidates {
            if let Some(content) = candidate.content {
                for raw in content.parts {
                    match WirePart::try_from(raw) {
                        Ok(part) => self.handle_part(part, at, out),
                        Err(err) => tracing::debug!(error = %err, "skipping empty stream part"),
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason.filter(|r| !r.is_empty()) {
                self.finish_reason = Some(reason);
            }
        }
    }

    fn handle_part(&mut self, part: WirePart, at: Duration, out: &mut Vec<StreamEvent>) {
        match part {
            WirePart::Thought { text, signature }
            | WirePart::Text {
                text,
                signature: signature @ Some(_),
            } => {
                if let Some(signature) = signature.as_deref() {
                    self.tracker.note_thinking_signature(signature);
                }
                self.push_thinking(&text, at, out);
            }
            WirePart::Text {
                text,
                signature: None,
            } => {
                let mut tag_events = std::mem::take(&mut self.tag_events);
                self.tags.push(&text, &mut tag_events);
                self.apply_tag_events(&mut tag_events, at, out);
                self.tag_events = tag_events;
            }
            WirePart::FunctionCall { call, signature } => {
                self.emit_tool_call(&call.name, call.id.as_deref(), call.args, signature.as_deref(), at, out);
            }
            WirePart::FunctionResponse(response) => {
                self.flush_text(at, out);
                self.close_thinking(out);
                let id = response.id.unwrap_or_else(|| response.name.clone());
                self.emit(
                    out,
                    StreamEvent::ToolResult {
                        id,
                        name: response.name,
                        payload: response.response,
                    },
                );
            }
            WirePart::InlineData(data) => {
                tracing::debug!(mime_type = %data.mime_type, "ignoring inline data in response stream");
            }
            WirePart::Signature(signature) => self.tracker.note_thinking_signature(&signature),
        }
    }

    fn apply_tag_events(
        &mut self,
        tag_events: &mut Vec<TagEvent>,
        at: Duration,
        out: &mut Vec<StreamEvent>,
    ) {
        for event in tag_events.drain(..) {
            match event {
                TagEvent::Text(text) => {
                    if self.thinking_open {
                        self.close_thinking(out);
                    }
                    self.text.push(&text);
                }
                TagEvent::Thinking(text) => self.push_thinking(&text, at, out),
                TagEvent::ThinkingEnd => self.close_thinking(out),
                TagEvent::ToolCall(call) => {
                    self.emit_tool_call(&call.name, call.id.as_deref(), call.args, None, at, out);
                }
            }
        }
    }

    fn push_thinking(&mut self, text: &str, at: Duration, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.flush_text(at, out);
        if !self.thinking_open {
            self.thinking_block += 1;
            self.thinking_open = true;
        }
        self.thinking.push(text);
        let mut chunks = Vec::new();
        self.thinking.take_chunks(&mut chunks);
        for text in chunks {
            let id = self.thinking_id();
            self.emit(out, StreamEvent::ThinkingDelta { id, text });
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(text) = self.thinking.take_all() {
            let id = self.thinking_id();
            self.emit(out, StreamEvent::ThinkingDelta { id, text });
        }
        self.thinking_open = false;
    }

    fn emit_tool_call(
        &mut self,
        name: &str,
        backend_id: Option<&str>,
        args: serde_json::Value,
        signature: Option<&str>,
        at: Duration,
        out: &mut Vec<StreamEvent>,
    ) {
        self.flush_text(at, out);
        self.close_thinking(out);
        if let Some(record) = self.tracker.observe(name, backend_id, args, signature) {
            self.tool_calls += 1;
            self.emit(
                out,
                StreamEvent::ToolCall {
                    id: record.call_id,
                    name: record.name,
                    args: record.args,
                },
            );
        }
    }

    fn flush_text_if_due(&mut self, at: Duration, out: &mut Vec<StreamEvent>) {
        let fast = self.meter.is_fast(self.velocity_threshold);
        if self.text.should_flush(at, fast) {
            self.flush_text(at, out);
        }
    }

    fn flush_text(&mut self, at: Duration, out: &mut Vec<StreamEvent>) {
        if let Some(text) = self.text.take(at) {
            self.emit(out, StreamEvent::TextDelta { text });
        }
    }

    fn thinking_id(&self) -> String {
        format!("thinking_{}", self.thinking_block)
    }

    fn emit(&mut self, out: &mut Vec<StreamEvent>, event: StreamEvent) {
        self.events_emitted += 1;
        out.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fc::signature_cache::SignatureCache;
    use serde_json::json;
    use std::sync::Arc;

    fn decoder() -> (Arc<SignatureCache>, StreamDecoder) {
        let cache = Arc::new(SignatureCache::new());
        let tracker = ToolCallTracker::new(Arc::clone(&cache), None);
        (cache, StreamDecoder::new(&StreamConfig::default(), tracker))
    }

    fn sse(chunk: &serde_json::Value) -> String {
        format!("data: {chunk}\n\n")
    }

    fn parts(parts: serde_json::Value) -> serde_json::Value {
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": parts}}]}})
    }

    fn decode_all(decoder: &mut StreamDecoder, input: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        decoder.feed(input.as_bytes(), Duration::ZERO, &mut out);
        decoder.finish(Duration::ZERO, &mut out);
        out
    }

    #[test]
    fn test_text_thinking_and_call_in_order() {
        let (cache, mut decoder) = decoder();
        let input = [
            sse(&parts(json!([{"text": "plan", "thought": true, "thoughtSignature": "sig-1"}]))),
            sse(&parts(json!([{"text": "Hello"}]))),
            sse(&parts(json!([{"functionCall": {"name": "lookup", "args": {"q": 1}, "id": "tc1"}}]))),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let events = decode_all(&mut decoder, &input);
        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingDelta { id: "thinking_1".into(), text: "plan".into() },
                StreamEvent::TextDelta { text: "Hello".into() },
                StreamEvent::ToolCall { id: "tc1".into(), name: "lookup".into(), args: json!({"q": 1}) },
            ]
        );
        assert!(decoder.is_done());
        assert_eq!(cache.lookup("tc1", None).as_deref(), Some("sig-1"));
    }

    #[test]
    fn test_concatenated_json_recovered() {
        let (_, mut decoder) = decoder();
        let first = parts(json!([{"text": "a"}]));
        let second = parts(json!([{"text": "b"}]));
        let events = decode_all(&mut decoder, &format!("data: {first}{second}\n\n"));
        assert_eq!(events, vec![StreamEvent::TextDelta { text: "ab".into() }]);
    }

    #[test]
    fn test_garbage_event_dropped() {
        let (_, mut decoder) = decoder();
        let events = decode_all(&mut decoder, "data: not json\n\ndata: {\"candidates\": [\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_inline_thinking_and_dedupe() {
        let (_, mut decoder) = decoder();
        let input = [
            sse(&parts(json!([{"functionCall": {"name": "search", "args": {"q": "x"}, "id": "c1"}}]))),
            sse(&parts(json!([{"text": "<thinking>hm</thinking><function_calls><tool_call name=\"search\" arguments='{\"q\":\"x\"}'/></function_calls>"}]))),
        ]
        .concat();
        let events = decode_all(&mut decoder, &input);
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCall { id: "c1".into(), name: "search".into(), args: json!({"q": "x"}) },
                StreamEvent::ThinkingDelta { id: "thinking_1".into(), text: "hm".into() },
            ]
        );
        assert_eq!(decoder.summary().tool_calls, 1);
    }

    #[test]
    fn test_function_response_and_summary() {
        let (_, mut decoder) = decoder();
        let chunk = json!({
            "candidates": [{
                "content": {"parts": [{"functionResponse": {"name": "f", "response": {"ok": true}}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "totalTokenCount": 9},
            "modelVersion": "gemini-2.5-pro"
        });
        let events = decode_all(&mut decoder, &sse(&chunk));
        assert_eq!(
            events,
            vec![StreamEvent::ToolResult { id: "f".into(), name: "f".into(), payload: json!({"ok": true}) }]
        );
        let summary = decoder.summary();
        assert_eq!(summary.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(summary.usage.and_then(|u| u.total_token_count), Some(9));
        assert_eq!(summary.model_version.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(summary.event_count, 1);
    }

    #[test]
    fn test_text_flushes_by_size_then_latency() {
        let (_, mut decoder) = decoder();
        let mut out = Vec::new();
        let long = "x".repeat(40);
        decoder.feed(sse(&parts(json!([{"text": long}]))).as_bytes(), Duration::ZERO, &mut out);
        assert_eq!(out.len(), 1);

        decoder.feed(sse(&parts(json!([{"text": "tail"}]))).as_bytes(), Duration::ZERO, &mut out);
        assert_eq!(out.len(), 1);
        decoder.tick(Duration::from_millis(79), &mut out);
        assert_eq!(out.len(), 1);
        decoder.tick(Duration::from_millis(80), &mut out);
        assert_eq!(out.last(), Some(&StreamEvent::TextDelta { text: "tail".into() }));
    }

    #[test]
    fn test_liveness_flushes_partial_thinking() {
        let (_, mut decoder) = decoder();
        let mut out = Vec::new();
        decoder.feed(
            sse(&parts(json!([{"text": "slow thought", "thought": true}]))).as_bytes(),
            Duration::ZERO,
            &mut out,
        );
        assert!(out.is_empty());
        decoder.tick(Duration::from_millis(1_999), &mut out);
        assert!(out.is_empty());
        decoder.tick(Duration::from_millis(2_000), &mut out);
        assert_eq!(
            out,
            vec![StreamEvent::ThinkingDelta { id: "thinking_1".into(), text: "slow thought".into() }]
        );
    }

    #[test]
    fn test_thinking_delivered_in_fixed_chunks() {
        let (_, mut decoder) = decoder();
        let thought = "t".repeat(100);
        let events = decode_all(&mut decoder, &sse(&parts(json!([{"text": thought, "thought": true}]))));
        let sizes: Vec<usize> = events
            .iter()
            .map(|e| match e {
                StreamEvent::ThinkingDelta { text, .. } => text.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![48, 48, 4]);
    }
}
