//! Caller-facing conversation model. Read-only input to the encoder.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One ordered part of a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    /// Stored reasoning text of an assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl ConversationTurn {
    #[must_use]
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            parts,
            thinking: None,
        }
    }

    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    #[must_use]
    pub fn system_text(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Specific(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingOptions {
    #[serde(default)]
    pub budget_tokens: Option<u32>,
}

/// A complete chat request as handed to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default)]
    pub generation: GenerationParams,
    /// Present when extended thinking is requested.
    #[serde(default)]
    pub thinking: Option<ThinkingOptions>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, turns: Vec<ConversationTurn>) -> Self {
        Self {
            model: model.into(),
            turns,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            thinking: None,
            session_id: None,
        }
    }

    #[must_use]
    pub fn thinking_enabled(&self) -> bool {
        self.thinking.is_some()
    }
}

/// Claude models served through the same backend reject replayed thought
/// parts and filler thinking.
#[must_use]
pub fn is_claude_family(model: &str) -> bool {
    model.to_ascii_lowercase().contains("claude")
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_from_json() {
        let json = r#"{
            "model": "gemini-2.5-pro",
            "turns": [
                {"role": "system", "parts": [{"type": "text", "text": "be brief"}]},
                {"role": "user", "parts": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image", "mime_type": "image/png", "data": "AQID"}
                ]},
                {"role": "assistant", "thinking": "look it up", "parts": [
                    {"type": "tool_call", "id": "tc1", "name": "lookup", "args": {"q": "x"}}
                ]},
                {"role": "user", "parts": [
                    {"type": "tool_result", "call_id": "tc1", "payload": "{\"ok\":true}"}
                ]}
            ],
            "tool_choice": {"specific": "lookup"},
            "thinking": {"budget_tokens": 1024}
        }"#;
        let request: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.turns.len(), 4);
        assert!(request.thinking_enabled());
        assert_eq!(request.tool_choice, ToolChoice::Specific("lookup".into()));
        match &request.turns[1].parts[1] {
            ContentPart::Image { data, .. } => assert_eq!(data, &vec![1, 2, 3]),
            other => panic!("expected image, got {other:?}"),
        }
        assert_eq!(request.turns[2].thinking.as_deref(), Some("look it up"));
    }

    #[test]
    fn test_is_claude_family() {
        assert!(is_claude_family("claude-sonnet-4-5"));
        assert!(is_claude_family("Claude-Opus"));
        assert!(!is_claude_family("gemini-2.5-pro"));
    }
}
