//! Pieces shared by the provider adapters.
//!
//! Each adapter runs its own producer loop over its native chunk type; the
//! parts here are composed into it: the consumer handle (`ChannelStream`),
//! the producer half that publishes text and finalizes stats (`Producer`),
//! and the state both halves see (`StreamShared`).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::LlmError;
use crate::model::{resolve_response_type, ChatStream, StreamStats, TokenUsage, ToolCall};
use crate::tokens::{AsyncTokenCounter, CountMode, TokenCounter};

/// Native chunk sequence as handed to a producer.
pub(crate) type ChunkStream<T> = BoxStream<'static, Result<T, LlmError>>;

/// A text fragment and the acknowledgement `recv` sends once it takes it.
type Handoff = (String, oneshot::Sender<()>);

/// Picks the local counter for a stream.
///
/// Tokenizer mode tries the model's own encoding, then cl100k, then falls
/// back to rune counting.
pub(crate) fn local_counter(mode: CountMode, model: &str) -> AsyncTokenCounter {
    match mode {
        CountMode::Rune => AsyncTokenCounter::with_counter(TokenCounter::rune()),
        CountMode::Tokenizer => AsyncTokenCounter::new(CountMode::Tokenizer, model)
            .unwrap_or_else(|err| {
                tracing::debug!(model, error = %err, "no encoding for model, trying cl100k");
                AsyncTokenCounter::cl100k_or_rune()
            }),
    }
}

/// Sends a streaming request and checks the status line.
///
/// Gives up with `Cancelled` when `cancel` fires first; a non-2xx reply
/// becomes `Upstream` carrying the response body.
pub(crate) async fn send(
    cancel: &CancellationToken,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, LlmError> {
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        resp = request.send() => resp?,
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(LlmError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

#[derive(Debug)]
struct StreamShared {
    start: Instant,
    first_token: AtomicBool,
    stats: Mutex<StreamStats>,
    error: Mutex<Option<LlmError>>,
    tool_calls: Mutex<Vec<ToolCall>>,
}

impl StreamShared {
    fn error(&self) -> Option<LlmError> {
        self.error.lock().clone()
    }
}

/// Log context carried by a producer.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamLabel {
    pub provider: &'static str,
    pub model: String,
    pub trace_id: String,
}

/// Producer half: owned by the background task of one stream.
pub(crate) struct Producer {
    shared: Arc<StreamShared>,
    tx: mpsc::Sender<Handoff>,
    counter: AsyncTokenCounter,
    cancel: CancellationToken,
    label: StreamLabel,
}

impl Producer {
    /// Next native chunk, or `None` once the source ends or the stream is
    /// cancelled.
    pub(crate) async fn next<T>(&self, chunks: &mut ChunkStream<T>) -> Option<Result<T, LlmError>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = chunks.next() => item,
        }
    }

    /// Records the first provider error; later ones are dropped.
    pub(crate) fn fail(&self, err: LlmError) {
        tracing::warn!(
            provider = self.label.provider,
            model = %self.label.model,
            trace_id = %self.label.trace_id,
            error = %err,
            "stream failed"
        );
        let mut slot = self.shared.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Stores an already normalized finish reason; empty means not terminal.
    pub(crate) fn set_finish_reason(&self, reason: &str) {
        if reason.is_empty() {
            return;
        }
        self.shared.stats.lock().finish_reason = reason.to_ascii_lowercase();
    }

    /// Last nonzero usage report wins.
    pub(crate) fn set_usage(&self, usage: TokenUsage) {
        if usage.total_tokens == 0 {
            return;
        }
        self.shared.stats.lock().usage = usage;
    }

    /// Hands one text fragment to the consumer and waits until `recv`
    /// has taken it.
    ///
    /// Returns `false` when the stream was cancelled or the consumer is gone.
    pub(crate) async fn publish(&self, text: String) -> bool {
        if text.is_empty() {
            return true;
        }
        if self
            .shared
            .first_token
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.stats.lock().ttft = self.shared.start.elapsed();
        }
        self.counter.append(&text);

        let (ack, taken) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            delivered = async {
                self.tx.send((text, ack)).await.is_ok() && taken.await.is_ok()
            } => delivered,
        }
    }

    /// Runs the one-time teardown and closes the channel.
    pub(crate) fn finish(self, tool_calls: Vec<ToolCall>) {
        let Self {
            shared,
            tx,
            counter,
            label,
            ..
        } = self;

        let stats = {
            let mut stats = shared.stats.lock();
            stats.total_latency = shared.start.elapsed();
            stats.local_token_count = counter.finally_calc();
            if stats.usage.total_tokens == 0 {
                stats.usage = TokenUsage {
                    prompt_tokens: counter.prompt_count(),
                    completion_tokens: stats.local_token_count,
                    total_tokens: counter.total_count(),
                };
            }
            stats.response_type = resolve_response_type(&stats.finish_reason, &tool_calls);
            stats.clone()
        };
        *shared.tool_calls.lock() = tool_calls;
        counter.close();

        tracing::debug!(
            provider = label.provider,
            model = %label.model,
            trace_id = %label.trace_id,
            ttft_ms = stats.ttft.as_millis() as u64,
            latency_ms = stats.total_latency.as_millis() as u64,
            total_tokens = stats.usage.total_tokens,
            finish_reason = %stats.finish_reason,
            response_type = ?stats.response_type,
            "stream finished"
        );

        drop(tx);
    }
}

/// Consumer handle returned by every adapter.
pub struct ChannelStream {
    shared: Arc<StreamShared>,
    rx: mpsc::Receiver<Handoff>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    _guard: DropGuard,
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("stats", &*self.shared.stats.lock())
            .finish()
    }
}

/// Spawns `run` as the single producer of a new stream.
///
/// The stream gets a child of `parent`, so cancelling the caller's token
/// cancels it; dropping the handle cancels it too.
pub(crate) fn spawn_stream<F, Fut>(
    parent: &CancellationToken,
    counter: AsyncTokenCounter,
    start: Instant,
    label: StreamLabel,
    run: F,
) -> ChannelStream
where
    F: FnOnce(Producer) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = parent.child_token();
    // Rendezvous: `publish` returns only after `recv` acknowledges.
    let (tx, rx) = mpsc::channel(1);
    let shared = Arc::new(StreamShared {
        start,
        first_token: AtomicBool::new(false),
        stats: Mutex::new(StreamStats::default()),
        error: Mutex::new(None),
        tool_calls: Mutex::new(Vec::new()),
    });

    tracing::debug!(
        provider = label.provider,
        model = %label.model,
        trace_id = %label.trace_id,
        prompt_tokens = counter.prompt_count(),
        "stream started"
    );

    let producer = Producer {
        shared: shared.clone(),
        tx,
        counter,
        cancel: cancel.clone(),
        label,
    };
    let handle = tokio::spawn(run(producer));

    ChannelStream {
        shared,
        rx,
        _guard: cancel.clone().drop_guard(),
        cancel,
        producer: Some(handle),
    }
}

#[async_trait]
impl ChatStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<String>, LlmError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.shared.error().unwrap_or(LlmError::Cancelled)),
            msg = self.rx.recv() => match msg {
                Some((text, ack)) => {
                    ack.send(()).ok();
                    Ok(Some(text))
                }
                None => match self.shared.error() {
                    Some(err) => Err(err),
                    None => Ok(None),
                },
            },
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    async fn finished(&mut self) {
        if let Some(handle) = self.producer.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "stream producer did not complete");
            }
        }
    }

    fn stats(&self) -> StreamStats {
        self.shared.stats.lock().clone()
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        self.shared.tool_calls.lock().clone()
    }
}
