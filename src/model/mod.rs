//! Provider-agnostic chat vocabulary.

mod stream;
mod tool;
mod types;

pub use stream::{resolve_response_type, ChatStream, LlmClient, StreamResponseType, StreamStats};
pub use tool::{JsonSchema, SchemaProperty, Tool, ToolCall, ToolChoice};
pub use types::{
    Attachment, ChatRequest, ChatResponse, Message, Role, SamplingParams, TokenUsage,
};
