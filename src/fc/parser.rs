//! Helpers for the inline `<tool_call name="…" arguments='…'/>` grammar.

use std::borrow::Cow;

use memchr::memchr;

/// A tool call recovered from inline tagged text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub id: Option<String>,
    pub args: serde_json::Value,
}

/// Index just past the `>` closing a tag whose attributes start at `from`,
/// skipping `>` inside quoted attribute values. `None` while incomplete.
#[must_use]
pub fn find_tag_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'') => {
                let close = memchr(quote, &bytes[i + 1..])?;
                i += close + 2;
            }
            b'>' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Tokenize `key="value"` / `key='value'` pairs in order. Bare words and
/// unquoted values are skipped.
#[must_use]
pub fn parse_attributes(attrs: &str) -> Vec<(String, String)> {
    let bytes = attrs.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace() || *b == b'/') {
            i += 1;
        }
        let key_start = i;
        while bytes
            .get(i)
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':'))
        {
            i += 1;
        }
        if i == key_start {
            i += 1;
            continue;
        }
        let key = &attrs[key_start..i];
        while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            continue;
        }
        i += 1;
        while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            i += 1;
        }
        let Some(&quote) = bytes.get(i) else { break };
        if quote != b'"' && quote != b'\'' {
            continue;
        }
        let value_start = i + 1;
        let Some(len) = memchr(quote, &bytes[value_start..]) else {
            break;
        };
        let value = &attrs[value_start..value_start + len];
        out.push((key.to_ascii_lowercase(), decode_xml_entities(value).into_owned()));
        i = value_start + len + 1;
    }
    out
}

pub fn decode_xml_entities(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let Some(first_amp) = memchr(b'&', bytes) else {
        return Cow::Borrowed(text);
    };

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..first_amp]);
    let mut i = first_amp;
    while i < bytes.len() {
        let rest = &bytes[i..];
        let (decoded, consumed) = if rest.starts_with(b"&amp;") {
            ('&', 5)
        } else if rest.starts_with(b"&lt;") {
            ('<', 4)
        } else if rest.starts_with(b"&gt;") {
            ('>', 4)
        } else if rest.starts_with(b"&quot;") {
            ('"', 6)
        } else if rest.starts_with(b"&apos;") {
            ('\'', 6)
        } else {
            ('&', 1)
        };
        out.push(decoded);
        i += consumed;

        let Some(next_rel) = memchr(b'&', &bytes[i..]) else {
            out.push_str(&text[i..]);
            break;
        };
        out.push_str(&text[i..i + next_rel]);
        i += next_rel;
    }
    Cow::Owned(out)
}

/// Arguments parse as a JSON object; any other JSON value, or text that is
/// not JSON, is wrapped as `{"value": …}`.
#[must_use]
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "value": other }),
        Err(_) => serde_json::json!({ "value": trimmed }),
    }
}

/// Build a call from a `<tool_call …>` tag's attribute text and optional
/// element body. The body is used for arguments only when the tag has no
/// `arguments` attribute.
#[must_use]
pub fn tool_call_from_tag(attrs: &str, body: Option<&str>) -> Option<ParsedToolCall> {
    let mut name = None;
    let mut id = None;
    let mut arguments = None;
    for (key, value) in parse_attributes(attrs) {
        match key.as_str() {
            "name" => name = Some(value.trim().to_string()),
            "id" => id = Some(value.trim().to_string()),
            "arguments" | "args" => arguments = Some(value),
            _ => {}
        }
    }
    let name = name.filter(|n| !n.is_empty())?;
    let args = match (arguments, body) {
        (Some(raw), _) => parse_arguments(&raw),
        (None, Some(body)) => parse_arguments(&decode_xml_entities(body)),
        (None, None) => serde_json::Value::Object(serde_json::Map::new()),
    };
    Some(ParsedToolCall {
        name,
        id: id.filter(|id| !id.is_empty()),
        args,
    })
}
