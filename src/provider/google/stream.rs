use std::collections::BTreeMap;
use std::time::Instant;

use futures_core::Stream;
use parking_lot::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::protocol::{GenerateContentResponse, Part, UsageMetadata};
use crate::error::LlmError;
use crate::model::{TokenUsage, ToolCall};
use crate::provider::driver::{spawn_stream, ChannelStream, ChunkStream, Producer, StreamLabel};
use crate::tokens::AsyncTokenCounter;

/// Merges whole function-call parts by call id.
///
/// Gemini sends each call as a complete object, possibly repeated across
/// frames; later non-empty fields overwrite earlier ones. Calls without an id
/// are keyed `idx:<part index>`.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    inner: Mutex<Keyed>,
}

#[derive(Debug, Default)]
struct Keyed {
    calls: BTreeMap<String, ToolCall>,
    /// First-seen key order
    order: Vec<String>,
}

impl ToolCallAccumulator {
    pub(crate) fn append(&self, parts: &[Part]) {
        let mut inner = self.inner.lock();
        for (idx, part) in parts.iter().enumerate() {
            let Some(fc) = &part.function_call else {
                continue;
            };
            let id = fc.id.as_deref().unwrap_or_default();
            let key = if id.is_empty() {
                format!("idx:{idx}")
            } else {
                id.to_string()
            };

            if !inner.calls.contains_key(&key) {
                inner.order.push(key.clone());
            }
            let current = inner.calls.entry(key).or_default();
            if !id.is_empty() {
                current.id = id.to_string();
            }
            if !fc.name.is_empty() {
                current.name.clone_from(&fc.name);
            }
            if let Some(args) = &fc.args {
                match serde_json::to_string(args) {
                    Ok(args) => current.arguments = args,
                    Err(err) => tracing::debug!(name = %fc.name, error = %err, "skipping unencodable args"),
                }
            }
            if !part.thought_signature.is_empty() {
                current.thought_signature.clone_from(&part.thought_signature);
            }
        }
    }

    /// Calls in first-seen order, or by key when no order was recorded.
    pub(crate) fn tool_calls(&self) -> Vec<ToolCall> {
        let inner = self.inner.lock();
        if inner.order.is_empty() {
            return inner.calls.values().cloned().collect();
        }
        inner
            .order
            .iter()
            .filter_map(|key| inner.calls.get(key).cloned())
            .collect()
    }
}

/// Lowercases a Gemini finish reason; the unspecified sentinel means "not terminal".
pub(crate) fn normalize_finish_reason(reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() || reason.eq_ignore_ascii_case("FINISH_REASON_UNSPECIFIED") {
        return String::new();
    }
    reason.to_ascii_lowercase()
}

impl From<UsageMetadata> for TokenUsage {
    fn from(u: UsageMetadata) -> Self {
        Self {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

fn parse_frame(data: &str) -> Result<GenerateContentResponse, LlmError> {
    let frame: GenerateContentResponse = serde_json::from_str(data)?;
    if let Some(err) = frame.error {
        let msg = if err.status.is_empty() {
            err.message
        } else {
            format!("{}: {}", err.status, err.message)
        };
        return Err(LlmError::Streaming(msg));
    }
    Ok(frame)
}

/// Decodes SSE payloads into `GenerateContentResponse` frames.
pub(crate) fn decode_chunks<S>(data: S) -> ChunkStream<GenerateContentResponse>
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    let frames = data
        .filter(|item| !matches!(item, Ok(d) if d.trim().is_empty()))
        .map(|item| item.and_then(|d| parse_frame(&d)));
    Box::pin(frames)
}

pub(crate) fn start_stream(
    parent: &CancellationToken,
    chunks: ChunkStream<GenerateContentResponse>,
    counter: AsyncTokenCounter,
    start: Instant,
    label: StreamLabel,
) -> ChannelStream {
    spawn_stream(parent, counter, start, label, move |p| produce(p, chunks))
}

async fn produce(p: Producer, mut chunks: ChunkStream<GenerateContentResponse>) {
    let acc = ToolCallAccumulator::default();

    'frames: while let Some(item) = p.next(&mut chunks).await {
        let frame = match item {
            Ok(frame) => frame,
            Err(err) => {
                p.fail(err);
                break;
            }
        };

        if let Some(usage) = frame.usage_metadata {
            p.set_usage(usage.into());
        }

        // Only the first candidate is surfaced.
        let Some(candidate) = frame.candidates.into_iter().next() else {
            continue;
        };
        if let Some(reason) = candidate.finish_reason.as_deref() {
            p.set_finish_reason(&normalize_finish_reason(reason));
        }
        let Some(content) = candidate.content else {
            continue;
        };

        acc.append(&content.parts);
        for part in content.parts {
            let Some(text) = part.text else {
                continue;
            };
            if !p.publish(text).await {
                break 'frames;
            }
        }
    }

    p.finish(acc.tool_calls());
}
