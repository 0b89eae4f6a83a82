//! Cloud Code `streamGenerateContent` wire types.
//!
//! Parts decode into the [`WirePart`] union at the parse boundary; a part
//! with no recognizable content is rejected there instead of travelling
//! deeper as untyped JSON.

use serde::{Deserialize, Serialize};

/// One turn of the wire `contents` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

impl WireContent {
    #[must_use]
    pub fn new(role: &str, parts: Vec<WirePart>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default)]
    pub response: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A single typed wire part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWirePart", into = "RawWirePart")]
pub enum WirePart {
    Text {
        text: String,
        signature: Option<String>,
    },
    Thought {
        text: String,
        signature: Option<String>,
    },
    InlineData(InlineData),
    FunctionCall {
        call: FunctionCall,
        signature: Option<String>,
    },
    FunctionResponse(FunctionResponse),
    /// A continuation signature not attached to any content.
    Signature(String),
}

impl WirePart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            signature: None,
        }
    }

    #[must_use]
    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought {
            text: text.into(),
            signature: None,
        }
    }

    #[must_use]
    pub fn is_function_call(&self) -> bool {
        matches!(self, Self::FunctionCall { .. })
    }

    #[must_use]
    pub fn is_function_response(&self) -> bool {
        matches!(self, Self::FunctionResponse(_))
    }

    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Text { signature, .. }
            | Self::Thought { signature, .. }
            | Self::FunctionCall { signature, .. } => signature.as_deref(),
            Self::Signature(signature) => Some(signature),
            Self::InlineData(_) | Self::FunctionResponse(_) => None,
        }
    }
}

/// Flat JSON shape of a part as the backend sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl TryFrom<RawWirePart> for WirePart {
    type Error = String;

    fn try_from(raw: RawWirePart) -> Result<Self, Self::Error> {
        let signature = raw.thought_signature.filter(|s| !s.is_empty());
        if let Some(call) = raw.function_call {
            return Ok(Self::FunctionCall { call, signature });
        }
        if let Some(response) = raw.function_response {
            return Ok(Self::FunctionResponse(response));
        }
        if let Some(data) = raw.inline_data {
            return Ok(Self::InlineData(data));
        }
        if let Some(text) = raw.text {
            if raw.thought == Some(true) {
                return Ok(Self::Thought { text, signature });
            }
            return Ok(Self::Text { text, signature });
        }
        if let Some(signature) = signature {
            return Ok(Self::Signature(signature));
        }
        if raw.thought == Some(true) {
            return Ok(Self::Thought {
                text: String::new(),
                signature: None,
            });
        }
        Err("unrecognized wire part".to_string())
    }
}

impl From<WirePart> for RawWirePart {
    fn from(part: WirePart) -> Self {
        match part {
            WirePart::Text { text, signature } => Self {
                text: Some(text),
                thought_signature: signature,
                ..Self::default()
            },
            WirePart::Thought { text, signature } => Self {
                text: Some(text),
                thought: Some(true),
                thought_signature: signature,
                ..Self::default()
            },
            WirePart::InlineData(data) => Self {
                inline_data: Some(data),
                ..Self::default()
            },
            WirePart::FunctionCall { call, signature } => Self {
                function_call: Some(call),
                thought_signature: signature,
                ..Self::default()
            },
            WirePart::FunctionResponse(response) => Self {
                function_response: Some(response),
                ..Self::default()
            },
            WirePart::Signature(signature) => Self {
                thought_signature: Some(signature),
                ..Self::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

/// Inner `request` object of a Cloud Code call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub contents: Vec<WireContent>,
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<WireContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Outer request body posted to `streamGenerateContent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCodeEnvelope {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub user_prompt_id: String,
    pub request: WireRequest,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<RawWirePart>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCandidate {
    #[serde(default)]
    pub content: Option<ResponseContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
    #[serde(default)]
    pub thoughts_token_count: Option<u64>,
    #[serde(default)]
    pub total_token_count: Option<u64>,
}

/// One decoded stream chunk.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChunk {
    #[serde(default)]
    pub candidates: Vec<WireCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChunkEnvelope {
    Wrapped { response: WireChunk },
    Bare(WireChunk),
}

/// Parse one stream chunk, accepting both the bare shape and the Cloud Code
/// `{"response": {...}}` envelope.
///
/// # Errors
///
/// Returns the underlying JSON error when `json` is not a chunk object.
pub fn parse_chunk(json: &str) -> Result<WireChunk, serde_json::Error> {
    let envelope: ChunkEnvelope = serde_json::from_str(json)?;
    Ok(match envelope {
        ChunkEnvelope::Wrapped { response } | ChunkEnvelope::Bare(response) => response,
    })
}
