//! Incremental scanner for tags embedded in plain model text:
//! `<thinking>…</thinking>` and `<function_calls>` blocks of `<tool_call/>`
//! entries. Tags may be split across any number of chunks.

use memchr::{memchr, memmem};

use crate::fc::parser::{find_tag_end, tool_call_from_tag, ParsedToolCall};

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";
const CALLS_OPEN: &str = "<function_calls>";
const CALLS_CLOSE: &str = "</function_calls>";
const TOOL_CALL_OPEN: &str = "<tool_call";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    Text(String),
    Thinking(String),
    ThinkingEnd,
    ToolCall(ParsedToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Thinking,
    FunctionCalls,
}

pub struct TagScanner {
    mode: Mode,
    carry: String,
    max_block_bytes: usize,
    calls_in_block: usize,
    /// Whitespace consumed after `<function_calls>` before the first entry.
    block_lead: String,
}

impl TagScanner {
    #[must_use]
    pub fn new(max_block_bytes: usize) -> Self {
        Self {
            mode: Mode::Text,
            carry: String::new(),
            max_block_bytes,
            calls_in_block: 0,
            block_lead: String::new(),
        }
    }

    pub fn push(&mut self, text: &str, out: &mut Vec<TagEvent>) {
        self.carry.push_str(text);
        loop {
            let progressed = match self.mode {
                Mode::Text => self.scan_text(out),
                Mode::Thinking => self.scan_thinking(out),
                Mode::FunctionCalls => self.scan_calls(out),
            };
            if !progressed {
                break;
            }
        }
    }

    /// Emit whatever is held back at end of stream.
    pub fn finish(&mut self, out: &mut Vec<TagEvent>) {
        let rest = std::mem::take(&mut self.carry);
        match self.mode {
            Mode::Text => push_text(out, rest),
            Mode::Thinking => {
                if !rest.is_empty() {
                    out.push(TagEvent::Thinking(rest));
                }
                out.push(TagEvent::ThinkingEnd);
            }
            Mode::FunctionCalls => {
                if self.calls_in_block == 0 {
                    let lead = std::mem::take(&mut self.block_lead);
                    push_text(out, format!("{CALLS_OPEN}{lead}{rest}"));
                } else if !rest.trim().is_empty() {
                    push_text(out, rest);
                }
            }
        }
        self.leave_block();
    }

    fn leave_block(&mut self) {
        self.mode = Mode::Text;
        self.calls_in_block = 0;
        self.block_lead.clear();
    }

    /// A block whose first entry has not arrived yet turned out to be prose.
    /// Give back the opening tag and rescan the carry as text.
    fn abandon_block(&mut self, out: &mut Vec<TagEvent>) -> bool {
        let lead = std::mem::take(&mut self.block_lead);
        push_text(out, format!("{CALLS_OPEN}{lead}"));
        self.leave_block();
        true
    }

    /// Returns true when the mode changed and the loop should rescan.
    fn scan_text(&mut self, out: &mut Vec<TagEvent>) -> bool {
        let bytes = self.carry.as_bytes();
        let mut from = 0usize;
        while let Some(rel) = memchr(b'<', &bytes[from..]) {
            let pos = from + rel;
            let rest = &self.carry[pos..];
            let next_mode = if rest.starts_with(THINKING_OPEN) {
                Some((Mode::Thinking, THINKING_OPEN.len()))
            } else if rest.starts_with(CALLS_OPEN) {
                Some((Mode::FunctionCalls, CALLS_OPEN.len()))
            } else {
                None
            };
            if let Some((mode, tag_len)) = next_mode {
                let before = self.carry[..pos].to_string();
                push_text(out, before);
                self.carry.drain(..pos + tag_len);
                self.leave_block();
                self.mode = mode;
                return true;
            }
            if THINKING_OPEN.starts_with(rest) || CALLS_OPEN.starts_with(rest) {
                let before = self.carry[..pos].to_string();
                push_text(out, before);
                self.carry.drain(..pos);
                return false;
            }
            from = pos + 1;
        }
        let all = std::mem::take(&mut self.carry);
        push_text(out, all);
        false
    }

    fn scan_thinking(&mut self, out: &mut Vec<TagEvent>) -> bool {
        if let Some(pos) = memmem::find(self.carry.as_bytes(), THINKING_CLOSE.as_bytes()) {
            let inner = self.carry[..pos].to_string();
            if !inner.is_empty() {
                out.push(TagEvent::Thinking(inner));
            }
            out.push(TagEvent::ThinkingEnd);
            self.carry.drain(..pos + THINKING_CLOSE.len());
            self.mode = Mode::Text;
            return true;
        }
        let hold = partial_suffix_len(&self.carry, THINKING_CLOSE);
        let emit_len = self.carry.len() - hold;
        if emit_len > 0 {
            let inner: String = self.carry.drain(..emit_len).collect();
            out.push(TagEvent::Thinking(inner));
        }
        false
    }

    fn scan_calls(&mut self, out: &mut Vec<TagEvent>) -> bool {
        loop {
            let pos = memchr(b'<', self.carry.as_bytes());
            if self.calls_in_block == 0 {
                let lead = &self.carry[..pos.unwrap_or(self.carry.len())];
                if !lead.trim().is_empty() {
                    return self.abandon_block(out);
                }
            }
            let Some(pos) = pos else {
                if self.calls_in_block == 0 {
                    self.block_lead.push_str(&self.carry);
                    self.carry.clear();
                    return self.overflow_if_needed(out);
                }
                // Stray content between entries.
                self.carry.clear();
                return false;
            };
            let rest = &self.carry[pos..];
            if rest.starts_with(CALLS_CLOSE) {
                self.carry.drain(..pos + CALLS_CLOSE.len());
                self.leave_block();
                return true;
            }
            if rest.starts_with(TOOL_CALL_OPEN) {
                let attrs_start = pos + TOOL_CALL_OPEN.len();
                match self.carry.as_bytes().get(attrs_start) {
                    Some(b) if b.is_ascii_whitespace() || *b == b'/' || *b == b'>' => {}
                    Some(_) if self.calls_in_block == 0 => return self.abandon_block(out),
                    Some(_) => {
                        self.carry.drain(..=pos);
                        continue;
                    }
                    None => return self.hold(pos, out),
                }
                match self.take_tool_call(attrs_start) {
                    Some((call, consumed)) => {
                        self.carry.drain(..consumed);
                        match call {
                            Some(call) => {
                                self.calls_in_block += 1;
                                self.block_lead.clear();
                                out.push(TagEvent::ToolCall(call));
                            }
                            None => tracing::warn!("dropping inline tool_call without a name"),
                        }
                        continue;
                    }
                    None => return self.hold(pos, out),
                }
            }
            if CALLS_CLOSE.starts_with(rest) || TOOL_CALL_OPEN.starts_with(rest) {
                return self.hold(pos, out);
            }
            if self.calls_in_block == 0 {
                return self.abandon_block(out);
            }
            self.carry.drain(..=pos);
        }
    }

    /// Parse a complete `<tool_call …/>` or `<tool_call …>body</tool_call>`
    /// whose attributes begin at `attrs_start`. `None` while the element is
    /// still incomplete.
    fn take_tool_call(&self, attrs_start: usize) -> Option<(Option<ParsedToolCall>, usize)> {
        let bytes = self.carry.as_bytes();
        let tag_end = find_tag_end(bytes, attrs_start)?;
        let attrs = self.carry[attrs_start..tag_end - 1].trim_end();
        if let Some(attrs) = attrs.strip_suffix('/') {
            return Some((tool_call_from_tag(attrs, None), tag_end));
        }
        let close_rel = memmem::find(&bytes[tag_end..], TOOL_CALL_CLOSE.as_bytes())?;
        let body = &self.carry[tag_end..tag_end + close_rel];
        Some((
            tool_call_from_tag(attrs, Some(body)),
            tag_end + close_rel + TOOL_CALL_CLOSE.len(),
        ))
    }

    /// Keep the partial entry starting at `pos` for the next chunk.
    fn hold(&mut self, pos: usize, out: &mut Vec<TagEvent>) -> bool {
        let skipped: String = self.carry.drain(..pos).collect();
        if self.calls_in_block == 0 {
            self.block_lead.push_str(&skipped);
        }
        self.overflow_if_needed(out)
    }

    fn overflow_if_needed(&mut self, out: &mut Vec<TagEvent>) -> bool {
        if self.block_lead.len() + self.carry.len() <= self.max_block_bytes {
            return false;
        }
        tracing::warn!(
            buffered_bytes = self.block_lead.len() + self.carry.len(),
            "inline function_calls block exceeded buffer limit; emitting as text"
        );
        let rest = std::mem::take(&mut self.carry);
        if self.calls_in_block == 0 {
            let lead = std::mem::take(&mut self.block_lead);
            push_text(out, format!("{CALLS_OPEN}{lead}{rest}"));
        } else {
            push_text(out, rest);
        }
        self.leave_block();
        true
    }
}

fn push_text(out: &mut Vec<TagEvent>, text: String) {
    if !text.is_empty() {
        out.push(TagEvent::Text(text));
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| text.as_bytes().ends_with(&tag.as_bytes()[..k]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan(chunks: &[&str]) -> Vec<TagEvent> {
        let mut scanner = TagScanner::new(1024);
        let mut out = Vec::new();
        for chunk in chunks {
            scanner.push(chunk, &mut out);
        }
        scanner.finish(&mut out);
        out
    }

    fn joined(events: &[TagEvent]) -> (String, String) {
        let mut text = String::new();
        let mut thinking = String::new();
        for event in events {
            match event {
                TagEvent::Text(t) => text.push_str(t),
                TagEvent::Thinking(t) => thinking.push_str(t),
                _ => {}
            }
        }
        (text, thinking)
    }

    #[test]
    fn test_thinking_split_at_every_offset() {
        let input = "before<thinking>ABC</thinking>after";
        for split in 0..=input.len() {
            let events = scan(&[&input[..split], &input[split..]]);
            let (text, thinking) = joined(&events);
            assert_eq!(text, "beforeafter", "split at {split}");
            assert_eq!(thinking, "ABC", "split at {split}");
            assert_eq!(
                events.iter().filter(|e| **e == TagEvent::ThinkingEnd).count(),
                1
            );
        }
    }

    #[test]
    fn test_lone_angle_bracket_is_text() {
        let events = scan(&["a < b", " <tag> c"]);
        assert_eq!(joined(&events).0, "a < b <tag> c");
    }

    #[test]
    fn test_function_calls_block() {
        let events = scan(&[
            "ok <function_calls>\n<tool_call name=\"search\" arguments='{\"q\":\"a > b\"}'/>",
            "\n<tool_call name=\"noop\"/>\n</function_calls> done",
        ]);
        let calls: Vec<&ParsedToolCall> = events
            .iter()
            .filter_map(|e| match e {
                TagEvent::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args, json!({"q": "a > b"}));
        assert_eq!(calls[1].args, json!({}));
        assert_eq!(joined(&events).0, "ok  done");
    }

    #[test]
    fn test_tool_call_split_byte_by_byte() {
        let input = "<function_calls><tool_call name=\"f\" arguments='{\"x\":1}'/></function_calls>";
        let chunks: Vec<String> = input.chars().map(String::from).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let events = scan(&refs);
        assert_eq!(
            events,
            vec![TagEvent::ToolCall(ParsedToolCall {
                name: "f".into(),
                id: None,
                args: json!({"x": 1}),
            })]
        );
    }

    #[test]
    fn test_tool_call_with_body_arguments() {
        let events = scan(&["<function_calls><tool_call name=\"f\">{\"a\":2}</tool_call></function_calls>"]);
        assert!(matches!(&events[0], TagEvent::ToolCall(c) if c.args == json!({"a": 2})));
    }

    #[test]
    fn test_prose_mentioning_block_tag_is_kept() {
        let input = "Use the <function_calls> wrapper when you want tools, then continue normally.";
        for split in 0..=input.len() {
            let events = scan(&[&input[..split], &input[split..]]);
            assert_eq!(joined(&events).0, input, "split at {split}");
            assert!(!events.iter().any(|e| matches!(e, TagEvent::ToolCall(_))));
        }
    }

    #[test]
    fn test_unterminated_block_is_text() {
        let events = scan(&["x <function_calls>\n  <tool_call name=\"f\" argu"]);
        assert_eq!(
            joined(&events).0,
            "x <function_calls>\n  <tool_call name=\"f\" argu"
        );
    }

    #[test]
    fn test_block_tag_followed_by_other_markup_is_text() {
        let events = scan(&["see <function_calls><b>bold</b> <thinking>t</thinking>"]);
        let (text, thinking) = joined(&events);
        assert_eq!(text, "see <function_calls><b>bold</b> ");
        assert_eq!(thinking, "t");
    }

    #[test]
    fn test_overflow_falls_back_to_text() {
        let mut scanner = TagScanner::new(16);
        let mut out = Vec::new();
        scanner.push("<function_calls><tool_call name=\"f\" arguments='", &mut out);
        scanner.push("{\"long\":\"xxxxxxxxxxxxxxxx\"}'/>", &mut out);
        scanner.finish(&mut out);
        let (text, _) = joined(&out);
        assert!(text.starts_with("<function_calls><tool_call"));
        assert!(!out.iter().any(|e| matches!(e, TagEvent::ToolCall(_))));
    }

    #[test]
    fn test_unterminated_thinking_closes_at_finish() {
        let events = scan(&["<thinking>partial</thi"]);
        assert_eq!(
            events,
            vec![
                TagEvent::Thinking("partial".into()),
                TagEvent::Thinking("</thi".into()),
                TagEvent::ThinkingEnd,
            ]
        );
    }
}
