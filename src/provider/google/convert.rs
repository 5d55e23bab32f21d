use std::collections::HashMap;

use serde_json::{Map, Value};

use super::protocol::{
    Blob, Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerationConfig, Part, ToolConfig, ToolDeclaration,
};
use crate::error::LlmError;
use crate::model::{ChatRequest, Message, Role, Tool, ToolCall, ToolChoice};
use crate::provider::attachment::{self, AttachmentPart};

const FALLBACK_RESPONSE_NAME: &str = "tool_response";

/// Builds the Gemini request plus one prompt string per message.
pub(crate) fn build_request(
    req: &ChatRequest,
) -> Result<(GenerateContentRequest, Vec<String>), LlmError> {
    let (contents, system_instruction, prompt_messages) = build_contents(&req.messages)?;

    let generation_config = GenerationConfig {
        max_output_tokens: (req.max_tokens > 0)
            .then(|| i32::try_from(req.max_tokens).unwrap_or(i32::MAX)),
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        // The API takes top_k as a number.
        top_k: req.sampling.top_k.map(|k| k as f32),
    };

    let body = GenerateContentRequest {
        contents,
        system_instruction,
        tools: tools_to_google(&req.tools),
        tool_config: tool_choice_to_google(req.tool_choice.as_ref(), &req.tools)?,
        generation_config: (!generation_config.is_empty()).then_some(generation_config),
    };
    Ok((body, prompt_messages))
}

fn build_contents(
    messages: &[Message],
) -> Result<(Vec<Content>, Option<Content>, Vec<String>), LlmError> {
    let mut contents = Vec::with_capacity(messages.len());
    let mut prompt_messages = Vec::with_capacity(messages.len());
    let mut system_texts = Vec::new();
    // Tool responses must name the function they answer.
    let mut call_names: HashMap<&str, &str> = HashMap::new();

    for m in messages {
        match m.role {
            Role::System => {
                let text = render_text(m)?;
                if !text.is_empty() {
                    system_texts.push(text.clone());
                }
                prompt_messages.push(text);
            }
            Role::User => {
                let (parts, prompt) = user_parts(m)?;
                contents.push(content("user", parts));
                prompt_messages.push(prompt);
            }
            Role::Assistant => {
                for tc in &m.tool_calls {
                    if !tc.id.is_empty() {
                        call_names.insert(&tc.id, &tc.name);
                    }
                }
                let (parts, prompt) = assistant_parts(m)?;
                contents.push(content("model", parts));
                prompt_messages.push(prompt);
            }
            Role::Tool => {
                let part = tool_response_part(m, &call_names)?;
                contents.push(content("user", vec![part]));
                prompt_messages.push(m.content.clone());
            }
        }
    }

    let system_instruction = (!system_texts.is_empty()).then(|| Content {
        role: Some("user".into()),
        parts: vec![Part::text(system_texts.join("\n"))],
    });
    Ok((contents, system_instruction, prompt_messages))
}

fn content(role: &str, mut parts: Vec<Part>) -> Content {
    if parts.is_empty() {
        parts.push(Part::text(""));
    }
    Content {
        role: Some(role.into()),
        parts,
    }
}

/// Message text with text attachments rendered inline.
fn render_text(m: &Message) -> Result<String, LlmError> {
    let mut parts = Vec::with_capacity(m.attachments.len() + 1);
    if !m.content.is_empty() {
        parts.push(m.content.clone());
    }
    for att in &m.attachments {
        parts.push(attachment::classify(att)?.prompt_text().to_string());
    }
    Ok(parts.join("\n"))
}

fn user_parts(m: &Message) -> Result<(Vec<Part>, String), LlmError> {
    let mut parts = Vec::with_capacity(m.attachments.len() + 1);
    let mut prompt = Vec::with_capacity(m.attachments.len() + 1);
    if !m.content.is_empty() {
        parts.push(Part::text(m.content.clone()));
        prompt.push(m.content.clone());
    }

    for att in &m.attachments {
        let classified = attachment::classify(att)?;
        prompt.push(classified.prompt_text().to_string());
        parts.push(match classified {
            AttachmentPart::Image { mime_type, data } => Part {
                inline_data: Some(Blob {
                    mime_type,
                    data: data.to_vec(),
                }),
                ..Part::default()
            },
            AttachmentPart::Text(text) => Part::text(text),
        });
    }

    Ok((parts, prompt.join("\n")))
}

fn assistant_parts(m: &Message) -> Result<(Vec<Part>, String), LlmError> {
    let mut parts = Vec::with_capacity(m.tool_calls.len() + 1);
    let mut prompt = Vec::with_capacity(m.tool_calls.len() + 1);
    if !m.content.is_empty() {
        parts.push(Part::text(m.content.clone()));
        prompt.push(m.content.clone());
    }

    for tc in &m.tool_calls {
        parts.push(function_call_part(tc)?);
        prompt.push(format!("{}({})", tc.name, tc.arguments));
    }

    Ok((parts, prompt.join("\n")))
}

fn function_call_part(tc: &ToolCall) -> Result<Part, LlmError> {
    let args = parse_args(&tc.arguments).map_err(|reason| LlmError::InvalidToolArguments {
        name: tc.name.clone(),
        reason,
    })?;
    Ok(Part {
        function_call: Some(FunctionCall {
            id: (!tc.id.is_empty()).then(|| tc.id.clone()),
            name: tc.name.clone(),
            args: Some(Value::Object(args)),
        }),
        thought_signature: tc.thought_signature.clone(),
        ..Part::default()
    })
}

/// Arguments must decode to a JSON object; blank means `{}`.
fn parse_args(raw: &str) -> Result<Map<String, Value>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

fn tool_response_part(m: &Message, call_names: &HashMap<&str, &str>) -> Result<Part, LlmError> {
    let id = m
        .tool_call_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(LlmError::MissingToolCallId)?;
    let name = call_names
        .get(id)
        .copied()
        .filter(|n| !n.is_empty())
        .unwrap_or(FALLBACK_RESPONSE_NAME);

    Ok(Part {
        function_response: Some(FunctionResponse {
            id: Some(id.to_string()),
            name: name.to_string(),
            response: tool_response_object(&m.content),
        }),
        ..Part::default()
    })
}

/// Objects pass through; scalars and plain text are wrapped as `output`.
fn tool_response_object(content: &str) -> Map<String, Value> {
    let content = content.trim();
    let output = match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => return map,
        Ok(value) if !content.is_empty() => value,
        _ => Value::String(content.to_string()),
    };
    let mut map = Map::new();
    map.insert("output".into(), output);
    map
}

fn tools_to_google(tools: &[Tool]) -> Vec<ToolDeclaration> {
    tools
        .iter()
        .map(|tool| ToolDeclaration {
            function_declarations: vec![FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters_json_schema: tool.parameters.to_value(),
            }],
        })
        .collect()
}

fn tool_choice_to_google(
    choice: Option<&ToolChoice>,
    tools: &[Tool],
) -> Result<Option<ToolConfig>, LlmError> {
    let Some(choice) = choice else {
        return Ok(None);
    };
    choice.validate(tools)?;

    let (mode, allowed_function_names) = match choice {
        ToolChoice::Auto => ("AUTO", Vec::new()),
        ToolChoice::None => ("NONE", Vec::new()),
        ToolChoice::Force { .. } => (
            "ANY",
            choice.forced_name().map(str::to_string).into_iter().collect(),
        ),
    };
    Ok(Some(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode,
            allowed_function_names,
        },
    }))
}
