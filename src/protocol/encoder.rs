use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustc_hash::FxHashMap;

use crate::auth::ModelLimits;
use crate::error::RelayError;
use crate::fc::signature_cache::{SignatureCache, PLACEHOLDER_SIGNATURE};
use crate::protocol::conversation::{
    is_claude_family, ChatRequest, ContentPart, ConversationTurn, Role, ToolChoice,
};
use crate::protocol::schema::sanitize_tool_schema;
use crate::protocol::wire::{
    FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse, GenerationConfig,
    InlineData, ThinkingConfig, ToolConfig, ToolDeclaration, WireContent, WirePart, WireRequest,
};

/// Thought text prepended to the last model turn when thinking is enabled
/// and the turn carries no thought of its own.
pub const FILLER_THINKING_TEXT: &str = "Thinking...";

const USER_ROLE: &str = "user";
const MODEL_ROLE: &str = "model";

/// Per-request encoder inputs that do not come from the conversation itself.
pub struct EncodeOptions<'a> {
    pub filler_thinking: bool,
    pub limits: Option<ModelLimits>,
    pub signatures: &'a SignatureCache,
}

/// Encode a chat request into the inner wire request.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when the request has no model, no
/// content turns, or carries images for a model that does not accept them.
pub fn encode_request(
    request: &ChatRequest,
    options: &EncodeOptions<'_>,
) -> Result<WireRequest, RelayError> {
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".into()));
    }
    if !request.turns.iter().any(|turn| turn.role != Role::System) {
        return Err(RelayError::InvalidRequest(
            "conversation must contain at least one user or assistant turn".into(),
        ));
    }

    let claude_target = is_claude_family(&request.model);
    let thinking_enabled = request.thinking_enabled();
    let session_id = request.session_id.as_deref();
    let image_input = options.limits.map_or(true, |limits| limits.image_input);

    let system_instruction = encode_system_instruction(&request.turns);

    let mut call_id_to_name: FxHashMap<&str, &str> = FxHashMap::default();
    for turn in &request.turns {
        for part in &turn.parts {
            if let ContentPart::ToolCall { id, name, .. } = part {
                call_id_to_name.insert(id.as_str(), name.as_str());
            }
        }
    }

    let mut contents = Vec::with_capacity(request.turns.len());
    for turn in &request.turns {
        let role = match turn.role {
            Role::System => continue,
            Role::User => USER_ROLE,
            Role::Assistant => MODEL_ROLE,
        };
        let mut parts = Vec::with_capacity(turn.parts.len() + 1);

        if turn.role == Role::Assistant && !claude_target {
            if let Some(thinking) = turn.thinking.as_deref().filter(|t| !t.trim().is_empty()) {
                parts.push(WirePart::thought(thinking));
            }
        }

        for part in &turn.parts {
            match part {
                ContentPart::Text { text } => {
                    if !text.is_empty() {
                        parts.push(WirePart::text(text.clone()));
                    }
                }
                ContentPart::Image { mime_type, data } => {
                    if !image_input {
                        return Err(RelayError::InvalidRequest(format!(
                            "model '{}' does not accept image input",
                            request.model
                        )));
                    }
                    parts.push(WirePart::InlineData(InlineData {
                        mime_type: mime_type.clone(),
                        data: STANDARD.encode(data),
                    }));
                }
                ContentPart::ToolCall { id, name, args } => {
                    parts.push(encode_tool_call(id, name, args, session_id, options.signatures));
                }
                ContentPart::ToolResult {
                    call_id,
                    payload,
                    name,
                } => {
                    // Prefer call-id binding; fall back to the result's own name, then the id.
                    let fn_name = call_id_to_name
                        .get(call_id.as_str())
                        .map(|name| (*name).to_string())
                        .or_else(|| name.clone())
                        .unwrap_or_else(|| call_id.clone());
                    parts.push(WirePart::FunctionResponse(FunctionResponse {
                        name: fn_name,
                        response: tool_result_response(payload),
                        id: non_empty(call_id),
                    }));
                }
            }
        }

        if !parts.is_empty() {
            contents.push(WireContent::new(role, parts));
        }
    }

    if thinking_enabled && !claude_target && options.filler_thinking {
        prepend_filler_thinking(&mut contents);
    }

    let tool_calling = options.limits.map_or(true, |limits| limits.tool_calling);
    if !request.tools.is_empty() && !tool_calling {
        tracing::warn!(
            model = %request.model,
            "model does not support tool calling; dropping tool declarations"
        );
    }
    let declare_tools = tool_calling && !request.tools.is_empty();
    let tools = declare_tools.then(|| {
        vec![ToolDeclaration {
            function_declarations: request
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(sanitize_tool_schema(&tool.parameters)),
                })
                .collect(),
        }]
    });
    let tool_config = if declare_tools {
        encode_tool_choice(&request.tool_choice)
    } else {
        None
    };

    let generation_config = encode_generation_config(request, options.limits);

    Ok(WireRequest {
        contents,
        generation_config,
        system_instruction,
        tools,
        tool_config,
        session_id: request.session_id.clone(),
    })
}

fn encode_system_instruction(turns: &[ConversationTurn]) -> Option<WireContent> {
    let mut blocks: Vec<&str> = Vec::new();
    for turn in turns.iter().filter(|turn| turn.role == Role::System) {
        for part in &turn.parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => blocks.push(text),
                ContentPart::Text { .. } => {}
                _ => tracing::warn!("ignoring non-text part in system turn"),
            }
        }
    }
    if blocks.is_empty() {
        return None;
    }
    Some(WireContent {
        role: Some(USER_ROLE.to_string()),
        parts: vec![WirePart::text(blocks.join("\n\n"))],
    })
}

fn encode_tool_call(
    id: &str,
    name: &str,
    args: &serde_json::Value,
    session_id: Option<&str>,
    signatures: &SignatureCache,
) -> WirePart {
    let signature = if id.is_empty() {
        PLACEHOLDER_SIGNATURE.to_string()
    } else if let Some(known) = signatures.lookup(id, session_id) {
        known
    } else {
        signatures.store(id, session_id, PLACEHOLDER_SIGNATURE);
        PLACEHOLDER_SIGNATURE.to_string()
    };
    let args = if args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    WirePart::FunctionCall {
        call: FunctionCall {
            name: name.to_string(),
            args,
            id: non_empty(id),
        },
        signature: Some(signature),
    }
}

/// The payload parsed as JSON when it is an object, otherwise wrapped as
/// `{"content": <raw text>}`.
#[must_use]
pub fn tool_result_response(payload: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => serde_json::json!({ "content": payload }),
    }
}

fn prepend_filler_thinking(contents: &mut [WireContent]) {
    let Some(last_model) = contents
        .iter_mut()
        .rev()
        .find(|content| content.role.as_deref() == Some(MODEL_ROLE))
    else {
        return;
    };
    let has_thought = last_model
        .parts
        .iter()
        .any(|part| matches!(part, WirePart::Thought { .. }));
    if !has_thought {
        last_model
            .parts
            .insert(0, WirePart::thought(FILLER_THINKING_TEXT));
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> Option<ToolConfig> {
    let (mode, allowed) = match choice {
        ToolChoice::Auto => return None,
        ToolChoice::None => ("NONE", None),
        ToolChoice::Required => ("ANY", None),
        ToolChoice::Specific(name) => ("ANY", Some(vec![name.clone()])),
    };
    Some(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}

fn encode_generation_config(request: &ChatRequest, limits: Option<ModelLimits>) -> GenerationConfig {
    let g = &request.generation;
    let limit = limits.and_then(|limits| limits.max_output_tokens);
    let max_output_tokens = match (g.max_output_tokens, limit) {
        (Some(requested), Some(limit)) if requested > limit => {
            tracing::debug!(requested, limit, "clamping maxOutputTokens to model limit");
            Some(limit)
        }
        (requested, _) => requested,
    };
    let thinking_config = request.thinking.map(|thinking| ThinkingConfig {
        include_thoughts: true,
        thinking_budget: thinking.budget_tokens,
    });
    GenerationConfig {
        temperature: g.temperature,
        top_p: g.top_p,
        max_output_tokens,
        stop_sequences: g.stop_sequences.clone(),
        thinking_config,
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::conversation::{ThinkingOptions, ToolSpec};
    use serde_json::json;

    fn options(cache: &SignatureCache) -> EncodeOptions<'_> {
        EncodeOptions {
            filler_thinking: true,
            limits: None,
            signatures: cache,
        }
    }

    fn tool_round_trip(model: &str) -> ChatRequest {
        let mut assistant = ConversationTurn::new(
            Role::Assistant,
            vec![
                ContentPart::text("checking"),
                ContentPart::ToolCall {
                    id: "tc1".into(),
                    name: "get_weather".into(),
                    args: json!({"city": "SF"}),
                },
            ],
        );
        assistant.thinking = Some("need weather".into());
        ChatRequest::new(
            model,
            vec![
                ConversationTurn::system_text("be brief"),
                ConversationTurn::system_text("use tools"),
                ConversationTurn::user_text("weather?"),
                assistant,
                ConversationTurn::new(
                    Role::User,
                    vec![ContentPart::ToolResult {
                        call_id: "tc1".into(),
                        payload: "sunny".into(),
                        name: None,
                    }],
                ),
            ],
        )
    }

    #[test]
    fn test_system_turns_concatenate() {
        let cache = SignatureCache::new();
        let wire = encode_request(&tool_round_trip("gemini-2.5-pro"), &options(&cache)).unwrap();
        let system = wire.system_instruction.unwrap();
        assert_eq!(system.parts, vec![WirePart::text("be brief\n\nuse tools")]);
        assert_eq!(wire.contents.len(), 3);
        assert_eq!(wire.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_tool_result_name_and_payload() {
        let cache = SignatureCache::new();
        let wire = encode_request(&tool_round_trip("gemini-2.5-pro"), &options(&cache)).unwrap();
        match &wire.contents[2].parts[0] {
            WirePart::FunctionResponse(response) => {
                assert_eq!(response.name, "get_weather");
                assert_eq!(response.response, json!({"content": "sunny"}));
                assert_eq!(response.id.as_deref(), Some("tc1"));
            }
            other => panic!("expected function response, got {other:?}"),
        }
        assert_eq!(tool_result_response(r#"{"t":1}"#), json!({"t": 1}));
        assert_eq!(tool_result_response("[1]"), json!({"content": "[1]"}));
    }

    #[test]
    fn test_tool_result_name_falls_back_to_own_name_then_id() {
        let cache = SignatureCache::new();
        let request = ChatRequest::new(
            "gemini-2.5-pro",
            vec![ConversationTurn::new(
                Role::User,
                vec![
                    ContentPart::ToolResult {
                        call_id: "x1".into(),
                        payload: "{}".into(),
                        name: Some("named".into()),
                    },
                    ContentPart::ToolResult {
                        call_id: "x2".into(),
                        payload: "{}".into(),
                        name: None,
                    },
                ],
            )],
        );
        let wire = encode_request(&request, &options(&cache)).unwrap();
        let names: Vec<_> = wire.contents[0]
            .parts
            .iter()
            .filter_map(|part| match part {
                WirePart::FunctionResponse(r) => Some(r.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["named", "x2"]);
    }

    #[test]
    fn test_placeholder_signature_is_cached_back() {
        let cache = SignatureCache::new();
        let wire = encode_request(&tool_round_trip("gemini-2.5-pro"), &options(&cache)).unwrap();
        let call = wire.contents[1]
            .parts
            .iter()
            .find(|part| part.is_function_call())
            .unwrap();
        assert_eq!(call.signature(), Some(PLACEHOLDER_SIGNATURE));
        assert_eq!(cache.lookup("tc1", None).as_deref(), Some(PLACEHOLDER_SIGNATURE));
    }

    #[test]
    fn test_cached_signature_is_reused() {
        let cache = SignatureCache::new();
        cache.store("tc1", None, "real-signature");
        let wire = encode_request(&tool_round_trip("gemini-2.5-pro"), &options(&cache)).unwrap();
        let call = wire.contents[1]
            .parts
            .iter()
            .find(|part| part.is_function_call())
            .unwrap();
        assert_eq!(call.signature(), Some("real-signature"));
    }

    #[test]
    fn test_stored_thinking_becomes_thought_part() {
        let cache = SignatureCache::new();
        let wire = encode_request(&tool_round_trip("gemini-2.5-pro"), &options(&cache)).unwrap();
        assert_eq!(wire.contents[1].parts[0], WirePart::thought("need weather"));
    }

    #[test]
    fn test_claude_target_suppresses_thoughts_and_filler() {
        let cache = SignatureCache::new();
        let mut request = tool_round_trip("claude-sonnet-4-5");
        request.thinking = Some(ThinkingOptions::default());
        let wire = encode_request(&request, &options(&cache)).unwrap();
        assert!(wire
            .contents
            .iter()
            .flat_map(|c| &c.parts)
            .all(|p| !matches!(p, WirePart::Thought { .. })));
    }

    #[test]
    fn test_filler_thinking_on_last_model_turn() {
        let cache = SignatureCache::new();
        let mut request = tool_round_trip("gemini-2.5-pro");
        request.turns[3].thinking = None;
        request.thinking = Some(ThinkingOptions {
            budget_tokens: Some(2048),
        });
        let wire = encode_request(&request, &options(&cache)).unwrap();
        assert_eq!(wire.contents[1].parts[0], WirePart::thought(FILLER_THINKING_TEXT));
        let thinking = wire.generation_config.thinking_config.unwrap();
        assert!(thinking.include_thoughts);
        assert_eq!(thinking.thinking_budget, Some(2048));

        let disabled = EncodeOptions {
            filler_thinking: false,
            ..options(&cache)
        };
        let wire = encode_request(&request, &disabled).unwrap();
        assert!(!matches!(wire.contents[1].parts[0], WirePart::Thought { .. }));
    }

    #[test]
    fn test_images_are_base64_inlined() {
        let cache = SignatureCache::new();
        let request = ChatRequest::new(
            "gemini-2.5-pro",
            vec![ConversationTurn::new(
                Role::User,
                vec![ContentPart::Image {
                    mime_type: "image/png".into(),
                    data: vec![1, 2, 3],
                }],
            )],
        );
        let wire = encode_request(&request, &options(&cache)).unwrap();
        assert_eq!(
            wire.contents[0].parts[0],
            WirePart::InlineData(InlineData {
                mime_type: "image/png".into(),
                data: "AQID".into(),
            })
        );

        let no_images = EncodeOptions {
            limits: Some(ModelLimits {
                max_input_tokens: None,
                max_output_tokens: None,
                tool_calling: true,
                image_input: false,
            }),
            ..options(&cache)
        };
        assert!(matches!(
            encode_request(&request, &no_images),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_tools_and_tool_choice() {
        let cache = SignatureCache::new();
        let mut request = tool_round_trip("gemini-2.5-pro");
        request.tools = vec![ToolSpec {
            name: "get_weather".into(),
            description: Some("weather".into()),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string", "minLength": 1}}}),
        }];
        request.tool_choice = ToolChoice::Specific("get_weather".into());
        let wire = encode_request(&request, &options(&cache)).unwrap();
        let decl = &wire.tools.unwrap()[0].function_declarations[0];
        assert_eq!(
            decl.parameters.as_ref().unwrap()["properties"]["city"],
            json!({"type": "string"})
        );
        let config = wire.tool_config.unwrap().function_calling_config;
        assert_eq!(config.mode, "ANY");
        assert_eq!(config.allowed_function_names, Some(vec!["get_weather".to_string()]));

        request.tool_choice = ToolChoice::Auto;
        assert!(encode_request(&request, &options(&cache))
            .unwrap()
            .tool_config
            .is_none());
    }

    #[test]
    fn test_max_output_tokens_clamped() {
        let cache = SignatureCache::new();
        let mut request = tool_round_trip("gemini-2.5-pro");
        request.generation.max_output_tokens = Some(100_000);
        let limited = EncodeOptions {
            limits: Some(ModelLimits {
                max_input_tokens: None,
                max_output_tokens: Some(65_536),
                tool_calling: true,
                image_input: true,
            }),
            ..options(&cache)
        };
        let wire = encode_request(&request, &limited).unwrap();
        assert_eq!(wire.generation_config.max_output_tokens, Some(65_536));
    }

    #[test]
    fn test_rejects_system_only_conversation() {
        let cache = SignatureCache::new();
        let request = ChatRequest::new("gemini-2.5-pro", vec![ConversationTurn::system_text("x")]);
        assert!(matches!(
            encode_request(&request, &options(&cache)),
            Err(RelayError::InvalidRequest(_))
        ));
    }
}
