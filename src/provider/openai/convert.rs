//! Unified request -> `OpenAI` wire request

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::protocol::{
    ChatCompletionRequest, ContentPart, FunctionCall, FunctionDefinition, ImageUrl, MessageContent,
    RequestMessage, RequestToolCall, StreamOptions, ToolDefinition,
};
use crate::error::LlmError;
use crate::model::{ChatRequest, Message, Role, Tool, ToolChoice};
use crate::provider::attachment::{self, AttachmentPart};

/// Builds the streaming request plus one prompt string per message for the
/// local token estimate.
pub(crate) fn build_stream_request(
    req: &ChatRequest,
) -> Result<(ChatCompletionRequest, Vec<String>), LlmError> {
    let (messages, prompt_messages) = build_messages(&req.messages)?;
    let tool_choice = tool_choice_to_openai(req.tool_choice.as_ref(), &req.tools)?;

    if req.sampling.top_k.is_some() {
        tracing::debug!(model = %req.model, "top_k is not supported by OpenAI, dropping it");
    }

    let body = ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_completion_tokens: (req.max_tokens > 0).then_some(req.max_tokens),
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        tools: tools_to_openai(&req.tools),
        tool_choice,
        stream: true,
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
    };
    Ok((body, prompt_messages))
}

fn build_messages(messages: &[Message]) -> Result<(Vec<RequestMessage>, Vec<String>), LlmError> {
    let mut out = Vec::with_capacity(messages.len());
    let mut prompt_messages = Vec::with_capacity(messages.len());

    for m in messages {
        let (content, prompt) = build_content(m)?;
        let mut prompt_parts = vec![prompt];

        let tool_calls = if m.role == Role::Assistant {
            m.tool_calls
                .iter()
                .map(|tc| {
                    prompt_parts.push(format!("{}({})", tc.name, tc.arguments));
                    RequestToolCall {
                        id: tc.id.clone(),
                        tool_type: "function",
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let tool_call_id = match m.role {
            Role::Tool => match m.tool_call_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => Some(id.to_string()),
                _ => return Err(LlmError::MissingToolCallId),
            },
            _ => None,
        };

        // An assistant turn that only calls tools carries no content.
        let content = match content {
            MessageContent::Text(text) if text.is_empty() && !tool_calls.is_empty() => None,
            other => Some(other),
        };

        out.push(RequestMessage {
            role: m.role.as_str(),
            content,
            tool_calls,
            tool_call_id,
        });
        prompt_parts.retain(|p| !p.is_empty());
        prompt_messages.push(prompt_parts.join("\n"));
    }

    Ok((out, prompt_messages))
}

fn build_content(m: &Message) -> Result<(MessageContent, String), LlmError> {
    if m.attachments.is_empty() {
        return Ok((MessageContent::Text(m.content.clone()), m.content.clone()));
    }

    let mut parts = Vec::with_capacity(m.attachments.len() + 1);
    let mut prompt_parts = Vec::with_capacity(m.attachments.len() + 1);
    if !m.content.is_empty() {
        parts.push(ContentPart::Text {
            text: m.content.clone(),
        });
        prompt_parts.push(m.content.clone());
    }

    for att in &m.attachments {
        let classified = attachment::classify(att)?;
        prompt_parts.push(classified.prompt_text().to_string());
        parts.push(match classified {
            AttachmentPart::Image { mime_type, data } => ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime_type};base64,{}", STANDARD.encode(data)),
                },
            },
            AttachmentPart::Text(text) => ContentPart::Text { text },
        });
    }

    Ok((MessageContent::Parts(parts), prompt_parts.join("\n")))
}

fn tools_to_openai(tools: &[Tool]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|tool| ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.to_value(),
            },
        })
        .collect()
}

fn tool_choice_to_openai(
    choice: Option<&ToolChoice>,
    tools: &[Tool],
) -> Result<Option<serde_json::Value>, LlmError> {
    let Some(choice) = choice else {
        return Ok(None);
    };
    choice.validate(tools)?;

    let value = match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Force { .. } => match choice.forced_name() {
            None => serde_json::json!("required"),
            Some(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name },
            }),
        },
    };
    Ok(Some(value))
}
