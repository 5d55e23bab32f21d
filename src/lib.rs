//! One chat contract over OpenAI-compatible and Google GenAI streaming APIs.
//!
//! A caller builds a [`ChatRequest`], asks an [`LlmClient`] for a
//! [`ChatStream`], drains it with `recv` and then reads the final
//! [`StreamStats`] and tool calls.

pub mod error;
pub mod model;
pub mod provider;
pub mod tokens;

pub use error::LlmError;
pub use model::{
    Attachment, ChatRequest, ChatResponse, ChatStream, LlmClient, Message, Role, SamplingParams,
    StreamResponseType, StreamStats, TokenUsage, Tool, ToolCall, ToolChoice,
};
