use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::tool::ToolCall;
use super::types::{ChatRequest, ChatResponse, TokenUsage};
use crate::error::LlmError;

/// How a finished stream answered: plain text or tool invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamResponseType {
    /// The stream ended without a terminal signal.
    #[default]
    Unknown,
    Text,
    ToolCall,
}

/// Timing and token accounting collected while a stream is produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub usage: TokenUsage,
    /// Time to the first non-empty text fragment.
    pub ttft: Duration,
    pub total_latency: Duration,
    /// Completion tokens counted locally from the streamed text.
    pub local_token_count: i64,
    /// Lowercased provider terminal signal; empty while not terminal.
    pub finish_reason: String,
    pub response_type: StreamResponseType,
}

/// Classifies a finished stream.
///
/// Tool calls win over everything; a finish reason without tool calls means
/// text; no finish reason at all stays `Unknown`.
pub fn resolve_response_type(finish_reason: &str, tool_calls: &[ToolCall]) -> StreamResponseType {
    if !tool_calls.is_empty() || finish_reason.eq_ignore_ascii_case("tool_calls") {
        return StreamResponseType::ToolCall;
    }
    if !finish_reason.is_empty() {
        return StreamResponseType::Text;
    }
    StreamResponseType::Unknown
}

/// A running chat completion.
///
/// Text fragments arrive through `recv` in provider order. Stats, tool calls
/// and the response type are only final once `recv` returned `Ok(None)` or
/// `finished` completed.
#[async_trait]
pub trait ChatStream: Send {
    /// Next text fragment.
    ///
    /// `Ok(None)` marks the end of the stream. After cancellation, or once the
    /// producer recorded an error, returns that error instead.
    async fn recv(&mut self) -> Result<Option<String>, LlmError>;

    /// Asks the producer to stop. Never fails; repeated calls are no-ops.
    fn close(&self);

    /// Waits until the producer has run its finalization.
    async fn finished(&mut self);

    fn stats(&self) -> StreamStats;

    /// Accumulated tool calls; empty until the producer finalized.
    fn tool_calls(&self) -> Vec<ToolCall>;

    fn response_type(&self) -> StreamResponseType {
        self.stats().response_type
    }

    fn finish_reason(&self) -> String {
        self.stats().finish_reason
    }
}

/// The request/response contract every provider client implements.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Translates `req` and starts a streamed completion.
    ///
    /// Translation errors are returned before any background task is spawned.
    /// Cancelling `cancel` stops the stream like `ChatStream::close` would.
    async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        req: ChatRequest,
    ) -> Result<Box<dyn ChatStream>, LlmError>;

    /// Drives `chat_stream` to completion and collects the whole reply.
    async fn chat(
        &self,
        cancel: &CancellationToken,
        req: ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let start = Instant::now();
        let mut stream = self.chat_stream(cancel, req).await?;

        let drained = drain(stream.as_mut()).await;
        stream.close();
        let content = drained?;

        let stats = stream.stats();
        let latency = if stats.total_latency.is_zero() {
            start.elapsed()
        } else {
            stats.total_latency
        };

        Ok(ChatResponse {
            content,
            tool_calls: stream.tool_calls(),
            usage: stats.usage,
            latency,
        })
    }
}

async fn drain(stream: &mut dyn ChatStream) -> Result<String, LlmError> {
    let mut content = String::new();
    while let Some(chunk) = stream.recv().await? {
        content.push_str(&chunk);
    }
    Ok(content)
}
