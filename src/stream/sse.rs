/// Incremental SSE (Server-Sent Events) parser.
///
/// Accepts raw bytes in arbitrary chunkings, holding back incomplete lines
/// and incomplete UTF-8 sequences until the rest arrives.
use super::SseEvent;
use memchr::memchr_iter;

const DONE_PAYLOAD: &str = "[DONE]";

pub struct SseParser {
    buffer: String,
    read_offset: usize,
    utf8_carry: Vec<u8>,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            utf8_carry: Vec::new(),
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
        }
    }

    /// Feed raw bytes and append complete events into `out`.
    ///
    /// - `data:` lines accumulate (joined with `\n`), one leading space stripped
    /// - a blank line dispatches the accumulated event
    /// - `data: [DONE]` dispatches anything pending, then a `[DONE]` event
    /// - `:` comments and unknown fields are ignored
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<SseEvent>) {
        if self.utf8_carry.is_empty() {
            if let Ok(text) = std::str::from_utf8(chunk) {
                self.buffer.push_str(text);
                self.scan_lines(out);
                return;
            }
        }
        self.utf8_carry.extend_from_slice(chunk);
        match std::str::from_utf8(&self.utf8_carry) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.utf8_carry.clear();
            }
            Err(e) if e.error_len().is_some() => {
                // Invalid sequence rather than a truncated one.
                let lossy = String::from_utf8_lossy(&self.utf8_carry).into_owned();
                self.buffer.push_str(&lossy);
                self.utf8_carry.clear();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                self.buffer.push_str(
                    std::str::from_utf8(&self.utf8_carry[..valid_up_to]).unwrap_or_default(),
                );
                self.utf8_carry.drain(..valid_up_to);
            }
        }
        self.scan_lines(out);
    }

    /// Dispatch whatever remains at end of stream, including a final line
    /// without a terminating newline.
    pub fn finish_into(&mut self, out: &mut Vec<SseEvent>) {
        if !self.utf8_carry.is_empty() {
            let lossy = String::from_utf8_lossy(&self.utf8_carry).into_owned();
            self.buffer.push_str(&lossy);
            self.utf8_carry.clear();
        }
        self.scan_lines(out);
        if self.read_offset < self.buffer.len() {
            let tail = self.buffer[self.read_offset..].to_string();
            let line = tail.strip_suffix('\r').unwrap_or(&tail);
            self.process_line(line, out);
        }
        self.buffer.clear();
        self.read_offset = 0;
        self.dispatch(out);
    }

    fn scan_lines(&mut self, out: &mut Vec<SseEvent>) {
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        let buffer = std::mem::take(&mut self.buffer);
        for rel_pos in memchr_iter(b'\n', &buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            self.process_line(line, out);
            processed_up_to = line_end + 1;
        }
        self.buffer = buffer;

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if value.trim() == DONE_PAYLOAD {
                self.dispatch(out);
                out.push(SseEvent {
                    event: None,
                    data: DONE_PAYLOAD.to_string(),
                    id: self.last_event_id.clone(),
                });
                return;
            }
            if self.has_data {
                self.data_buffer.push('\n');
            } else {
                self.has_data = true;
            }
            self.data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.last_event_id = Some(value.to_string());
        }
    }

    fn dispatch(&mut self, out: &mut Vec<SseEvent>) {
        if self.has_data {
            out.push(SseEvent {
                event: self.event_type.take(),
                data: std::mem::take(&mut self.data_buffer),
                id: self.last_event_id.clone(),
            });
            self.has_data = false;
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if an [`SseEvent`] is the terminal `[DONE]` marker.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == DONE_PAYLOAD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&[u8]]) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        for chunk in chunks {
            parser.feed_into(chunk, &mut out);
        }
        parser.finish_into(&mut out);
        out
    }

    #[test]
    fn test_blank_line_dispatches() {
        let events = feed_all(&[b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[1].data, r#"{"b":2}"#);
    }

    #[test]
    fn test_multi_line_data_joined() {
        let events = feed_all(&[b"data: {\"a\":\ndata: 1}\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_done_flushes_pending_data_first() {
        let events = feed_all(&[b"data: {\"a\":1}\ndata: [DONE]\n"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert!(is_done_event(&events[1]));
    }

    #[test]
    fn test_split_across_chunks_and_crlf() {
        let events = feed_all(&[b"da", b"ta: x", b"y\r", b"\n\r\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "xy");
    }

    #[test]
    fn test_utf8_split_inside_codepoint() {
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let events = feed_all(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let events = feed_all(&[b": keepalive\nevent: message\ndata: tail"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
        assert_eq!(events[0].event.as_deref(), Some("message"));
    }
}
