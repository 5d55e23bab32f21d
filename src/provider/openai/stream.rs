use std::collections::BTreeMap;
use std::time::Instant;

use futures_core::Stream;
use parking_lot::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::protocol::{ChatCompletionChunk, StreamToolCall, Usage};
use crate::error::LlmError;
use crate::model::{TokenUsage, ToolCall};
use crate::provider::driver::{spawn_stream, ChannelStream, ChunkStream, Producer, StreamLabel};
use crate::tokens::AsyncTokenCounter;

const DONE_SENTINEL: &str = "[DONE]";

/// Merges `OpenAI` tool call deltas by their `index`.
///
/// `id` and `name` are taken from the first fragment that carries them;
/// argument fragments are concatenated in arrival order.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: Mutex<BTreeMap<u32, ToolCall>>,
}

impl ToolCallAccumulator {
    pub(crate) fn append(&self, fragments: &[StreamToolCall]) {
        let mut calls = self.calls.lock();
        for fragment in fragments {
            let index = fragment
                .index
                .unwrap_or_else(|| u32::try_from(calls.len()).unwrap_or(u32::MAX));
            let current = calls.entry(index).or_default();

            if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
                if current.id.is_empty() {
                    current.id = id.to_string();
                }
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                    if current.name.is_empty() {
                        current.name = name.to_string();
                    }
                }
                if let Some(arguments) = &function.arguments {
                    current.arguments.push_str(arguments);
                }
            }
        }
    }

    /// Calls in ascending index order.
    pub(crate) fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls.lock().values().cloned().collect()
    }
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

fn parse_chunk(data: &str) -> Result<ChatCompletionChunk, LlmError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    if let Some(err) = chunk.error {
        return Err(LlmError::Streaming(err.message));
    }
    Ok(chunk)
}

/// Turns SSE payloads into completion chunks, stopping at `[DONE]`.
pub(crate) fn decode_chunks<S>(data: S) -> ChunkStream<ChatCompletionChunk>
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    let chunks = data
        .filter(|item| !matches!(item, Ok(d) if d.trim().is_empty()))
        .take_while(|item| !matches!(item, Ok(d) if d.trim() == DONE_SENTINEL))
        .map(|item| item.and_then(|d| parse_chunk(&d)));
    Box::pin(chunks)
}

pub(crate) fn start_stream(
    parent: &CancellationToken,
    chunks: ChunkStream<ChatCompletionChunk>,
    counter: AsyncTokenCounter,
    start: Instant,
    label: StreamLabel,
) -> ChannelStream {
    spawn_stream(parent, counter, start, label, move |p| produce(p, chunks))
}

async fn produce(p: Producer, mut chunks: ChunkStream<ChatCompletionChunk>) {
    let acc = ToolCallAccumulator::default();

    while let Some(item) = p.next(&mut chunks).await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                p.fail(err);
                break;
            }
        };

        if let Some(usage) = chunk.usage {
            p.set_usage(usage.into());
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };
        if let Some(reason) = choice.finish_reason.as_deref() {
            p.set_finish_reason(reason);
        }
        if let Some(fragments) = &choice.delta.tool_calls {
            acc.append(fragments);
        }
        if let Some(text) = choice.delta.content {
            if !p.publish(text).await {
                break;
            }
        }
    }

    p.finish(acc.tool_calls());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatStream, StreamResponseType};
    use crate::provider::openai::protocol::StreamFunctionCall;
    use crate::tokens::TokenCounter;

    fn fragment(index: u32, id: &str, name: &str, arguments: &str) -> StreamToolCall {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        StreamToolCall {
            index: Some(index),
            id: opt(id),
            function: Some(StreamFunctionCall {
                name: opt(name),
                arguments: opt(arguments),
            }),
        }
    }

    fn data(events: &[&str]) -> Vec<Result<String, LlmError>> {
        events.iter().map(|e| Ok((*e).to_string())).collect()
    }

    fn open(events: Vec<Result<String, LlmError>>) -> ChannelStream {
        let counter = AsyncTokenCounter::with_counter(TokenCounter::rune());
        start_stream(
            &CancellationToken::new(),
            decode_chunks(tokio_stream::iter(events)),
            counter,
            Instant::now(),
            StreamLabel::default(),
        )
    }

    async fn drain(stream: &mut ChannelStream) -> Result<String, LlmError> {
        let mut out = String::new();
        while let Some(text) = stream.recv().await? {
            out.push_str(&text);
        }
        Ok(out)
    }

    #[test]
    fn accumulator_concatenates_arguments_per_index() {
        let acc = ToolCallAccumulator::default();
        acc.append(&[fragment(0, "call_1", "lookup_weather", r#"{"city":"#)]);
        acc.append(&[fragment(0, "", "", r#""Beijing"}"#)]);
        acc.append(&[fragment(1, "call_2", "lookup_time", r#"{"city":"Beijing"}"#)]);

        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "lookup_weather");
        assert_eq!(calls[0].arguments, r#"{"city":"Beijing"}"#);
        assert_eq!(calls[1].id, "call_2");
        assert_eq!(calls[1].name, "lookup_time");
    }

    #[test]
    fn accumulator_keeps_first_id_and_orders_by_index() {
        let acc = ToolCallAccumulator::default();
        acc.append(&[fragment(1, "call_b", "second", "")]);
        acc.append(&[fragment(0, "call_a", "first", "{}")]);
        acc.append(&[fragment(0, "call_z", "renamed", "")]);

        let calls = acc.tool_calls();
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn fragment_without_index_takes_next_slot() {
        let acc = ToolCallAccumulator::default();
        acc.append(&[fragment(0, "call_1", "a", "")]);
        acc.append(&[StreamToolCall {
            index: None,
            id: Some("call_2".into()),
            function: None,
        }]);
        assert_eq!(acc.tool_calls()[1].id, "call_2");
    }

    #[tokio::test]
    async fn decode_stops_at_done_and_skips_blank_events() {
        let mut chunks = decode_chunks(tokio_stream::iter(data(&[
            "",
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"never"}}]}"#,
        ])));
        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("a"));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn decode_surfaces_inline_errors() {
        let mut chunks = decode_chunks(tokio_stream::iter(data(&[
            r#"{"error":{"message":"rate limited"}}"#,
        ])));
        assert_eq!(
            chunks.next().await.unwrap().unwrap_err(),
            LlmError::Streaming("rate limited".into())
        );
    }

    #[tokio::test]
    async fn text_stream_uses_provider_usage() {
        let mut stream = open(data(&[
            r#"{"choices":[{"delta":{"content":"Hello "}}]}"#,
            r#"{"choices":[{"delta":{"content":"world"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "[DONE]",
        ]));

        assert_eq!(drain(&mut stream).await.unwrap(), "Hello world");
        let stats = stream.stats();
        assert_eq!(stats.usage.total_tokens, 7);
        assert_eq!(stats.usage.prompt_tokens, 5);
        assert_eq!(stats.finish_reason, "stop");
        assert_eq!(stream.response_type(), StreamResponseType::Text);
        assert!(stats.ttft <= stats.total_latency);
        assert!(stream.tool_calls().is_empty());
    }

    #[tokio::test]
    async fn tool_call_stream_collects_calls() {
        let mut stream = open(data(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup_weather","arguments":"{\"city\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Beijing\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]));

        assert_eq!(drain(&mut stream).await.unwrap(), "");
        let calls = stream.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, r#"{"city":"Beijing"}"#);
        assert_eq!(stream.response_type(), StreamResponseType::ToolCall);
        assert_eq!(stream.finish_reason(), "tool_calls");
    }

    #[tokio::test]
    async fn error_mid_stream_keeps_partial_state() {
        let mut events = data(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup_weather"}}]}}]}"#,
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
        ]);
        events.push(Err(LlmError::Transport("connection reset".into())));
        let mut stream = open(events);

        assert_eq!(stream.recv().await, Ok(Some("partial".into())));
        assert_eq!(
            stream.recv().await,
            Err(LlmError::Transport("connection reset".into()))
        );
        stream.finished().await;
        assert_eq!(stream.tool_calls()[0].id, "call_1");
        assert_eq!(stream.response_type(), StreamResponseType::ToolCall);
    }

    #[tokio::test]
    async fn close_mid_flight_still_finalizes() {
        let events = tokio_stream::iter(data(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup_weather","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
        ]))
        .chain(tokio_stream::pending());
        let mut stream = start_stream(
            &CancellationToken::new(),
            decode_chunks(events),
            AsyncTokenCounter::with_counter(TokenCounter::rune()),
            Instant::now(),
            StreamLabel::default(),
        );

        assert_eq!(stream.recv().await, Ok(Some("Hi".into())));
        stream.close();
        assert_eq!(stream.recv().await, Err(LlmError::Cancelled));
        stream.finished().await;

        let stats = stream.stats();
        assert!(!stats.total_latency.is_zero());
        assert_eq!(stats.local_token_count, 1);
        assert_eq!(stream.tool_calls().len(), 1);
        assert_eq!(stream.response_type(), StreamResponseType::ToolCall);
    }
}
