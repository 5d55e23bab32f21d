use thiserror::Error;

/// Errors produced while translating, streaming or counting a chat.
///
/// The type is `Clone` because a stream keeps its first recorded error and
/// hands it out again on every later `recv`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// Attachment MIME type has no mapping for the target provider
    #[error("unsupported attachment type: {mime_type}")]
    UnsupportedAttachment { mime_type: String },

    /// Image attachment without payload
    #[error("image attachment {file_name:?} data is empty")]
    EmptyAttachment { file_name: String },

    /// Message role not known to the unified model
    #[error("unsupported message role: {0}")]
    UnsupportedRole(String),

    /// Tool choice that cannot be expressed or names an undeclared tool
    #[error("invalid tool choice: {0}")]
    InvalidToolChoice(String),

    /// Assistant tool call arguments that are not a JSON object
    #[error("invalid tool call args for {name}: {reason}")]
    InvalidToolArguments { name: String, reason: String },

    /// Tool message that does not reference a prior tool call
    #[error("tool message missing tool_call_id")]
    MissingToolCallId,

    /// No tokenizer encoding exists for the model
    #[error("unsupported model for tokenizer: {0}")]
    UnsupportedModel(String),

    /// Connection-level failure before or while reading the response
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider answered with a non-success HTTP status
    #[error("provider returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Malformed event stream
    #[error("streaming error: {0}")]
    Streaming(String),

    /// Provider payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The stream's cancellation token fired
    #[error("stream cancelled")]
    Cancelled,

    /// Client construction failed (bad base URL, header, ...)
    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Whether the error was raised while mapping a request to provider format.
    ///
    /// Translation errors surface from `chat_stream` before any background
    /// work starts.
    pub const fn is_translation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAttachment { .. }
                | Self::EmptyAttachment { .. }
                | Self::UnsupportedRole(_)
                | Self::InvalidToolChoice(_)
                | Self::InvalidToolArguments { .. }
                | Self::MissingToolCallId
        )
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
