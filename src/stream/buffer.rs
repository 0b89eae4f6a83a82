//! Adaptive delivery buffers driven by a logical clock.

use std::time::Duration;

/// Byte arrival rate over the most recent measurement window.
#[derive(Debug, Default)]
pub struct VelocityMeter {
    window_start: Option<Duration>,
    window_bytes: usize,
    bytes_per_ms: f64,
}

impl VelocityMeter {
    const MIN_WINDOW: Duration = Duration::from_millis(1);

    pub fn record(&mut self, bytes: usize, at: Duration) {
        let start = *self.window_start.get_or_insert(at);
        self.window_bytes += bytes;
        let elapsed = at.saturating_sub(start);
        if elapsed >= Self::MIN_WINDOW {
            self.bytes_per_ms = self.window_bytes as f64 / elapsed.as_secs_f64() / 1000.0;
            self.window_start = Some(at);
            self.window_bytes = 0;
        }
    }

    #[must_use]
    pub fn bytes_per_ms(&self) -> f64 {
        self.bytes_per_ms
    }

    #[must_use]
    pub fn is_fast(&self, threshold_bytes_per_ms: f64) -> bool {
        self.bytes_per_ms > threshold_bytes_per_ms
    }
}

/// Pending plain text, flushed by size or by latency since the last flush.
#[derive(Debug)]
pub struct TextBuffer {
    pending: String,
    pending_chars: usize,
    last_flush: Duration,
    min_chars: usize,
    max_latency: Duration,
}

impl TextBuffer {
    #[must_use]
    pub fn new(min_chars: usize, max_latency: Duration) -> Self {
        Self {
            pending: String::new(),
            pending_chars: 0,
            last_flush: Duration::ZERO,
            min_chars,
            max_latency,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.pending.push_str(text);
        self.pending_chars += text.chars().count();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a flush is due at `now`; thresholds halve when `fast`.
    #[must_use]
    pub fn should_flush(&self, now: Duration, fast: bool) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let (min_chars, max_latency) = if fast {
            ((self.min_chars / 2).max(1), self.max_latency / 2)
        } else {
            (self.min_chars, self.max_latency)
        };
        self.pending_chars >= min_chars || now.saturating_sub(self.last_flush) >= max_latency
    }

    /// Take and clear the pending text.
    pub fn take(&mut self, now: Duration) -> Option<String> {
        self.last_flush = now;
        if self.pending.is_empty() {
            return None;
        }
        self.pending_chars = 0;
        Some(std::mem::take(&mut self.pending))
    }
}

/// Pending thinking text, delivered in fixed character-count chunks.
#[derive(Debug)]
pub struct ThinkingBuffer {
    pending: String,
    chunk_chars: usize,
}

impl ThinkingBuffer {
    #[must_use]
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            pending: String::new(),
            chunk_chars: chunk_chars.max(1),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Drain every complete chunk, leaving the remainder pending.
    pub fn take_chunks(&mut self, out: &mut Vec<String>) {
        loop {
            let Some((idx, ch)) = self.pending.char_indices().nth(self.chunk_chars - 1) else {
                return;
            };
            out.push(self.pending.drain(..idx + ch.len_utf8()).collect());
        }
    }

    /// Take and clear everything pending.
    pub fn take_all(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_velocity_ignores_zero_elapsed() {
        let mut meter = VelocityMeter::default();
        meter.record(1000, Duration::ZERO);
        meter.record(1000, Duration::ZERO);
        assert!(meter.bytes_per_ms().abs() < f64::EPSILON);
        meter.record(0, ms(10));
        assert!((meter.bytes_per_ms() - 200.0).abs() < 1e-6);
        assert!(meter.is_fast(4.0));
    }

    #[test]
    fn test_text_flush_by_size_and_latency() {
        let mut buffer = TextBuffer::new(8, ms(80));
        buffer.push("abc");
        assert!(!buffer.should_flush(ms(10), false));
        assert!(buffer.should_flush(ms(80), false));
        buffer.push("defgh");
        assert!(buffer.should_flush(ms(10), false));
        assert_eq!(buffer.take(ms(10)).as_deref(), Some("abcdefgh"));
        assert!(buffer.is_empty());
        assert!(!buffer.should_flush(ms(500), false));
    }

    #[test]
    fn test_text_thresholds_halve_when_fast() {
        let mut buffer = TextBuffer::new(8, ms(80));
        buffer.push("abcd");
        assert!(!buffer.should_flush(Duration::ZERO, false));
        assert!(buffer.should_flush(Duration::ZERO, true));
        let _ = buffer.take(Duration::ZERO);
        buffer.push("x");
        assert!(buffer.should_flush(ms(40), true));
        assert!(!buffer.should_flush(ms(40), false));
    }

    #[test]
    fn test_thinking_chunks_by_chars() {
        let mut buffer = ThinkingBuffer::new(3);
        buffer.push("héllowo");
        let mut out = Vec::new();
        buffer.take_chunks(&mut out);
        assert_eq!(out, vec!["hél".to_string(), "low".to_string()]);
        assert_eq!(buffer.take_all().as_deref(), Some("o"));
        assert!(buffer.take_all().is_none());
    }
}
