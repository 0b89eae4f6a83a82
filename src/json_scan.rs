use std::ops::Range;

/// End of the string literal starting at `start` (the opening quote).
/// Unlike strict JSON, raw control bytes are tolerated.
#[inline]
pub(crate) fn parse_json_string_end(bytes: &[u8], start: usize) -> Result<usize, ()> {
    let len = bytes.len();
    if start >= len || bytes[start] != b'"' {
        return Err(());
    }
    let mut i = start + 1;
    while i < len {
        match bytes[i] {
            b'"' => return Ok(i + 1),
            b'\\' => {
                i += 1;
                if i >= len {
                    return Err(());
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    Err(())
}

/// Split a buffer into balanced `{…}` ranges at nesting depth zero.
///
/// Braces inside string literals are ignored. Bytes between objects are
/// skipped, as is an unterminated trailing object.
pub(crate) fn split_top_level_objects(bytes: &[u8]) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if depth > 0 => match parse_json_string_end(bytes, i) {
                Ok(end) => {
                    i = end;
                    continue;
                }
                Err(()) => break,
            },
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    out.push(start..i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    out
}
