const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

#[inline]
pub(crate) fn random_hex_id(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 16);
    out.push_str(prefix);
    push_u64_hex_16(&mut out, fastrand::u64(..));
    out
}

/// Id for a tool call that arrived without a backend-provided one.
#[inline]
pub(crate) fn generated_call_id() -> String {
    random_hex_id("call_")
}

/// Character-boundary-safe prefix of at most `max_bytes` bytes.
pub(crate) fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_id_shape() {
        let id = generated_call_id();
        assert_eq!(id.len(), "call_".len() + 16);
        assert!(id.starts_with("call_"));
        assert!(id[5..].bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(generated_call_id(), generated_call_id());
    }

    #[test]
    fn test_push_u64_hex_16_pads() {
        let mut out = String::new();
        push_u64_hex_16(&mut out, 0x1234_abcd);
        assert_eq!(out, "000000001234abcd");
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
