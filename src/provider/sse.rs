use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_core::stream::BoxStream;
use futures_core::Stream;

use crate::error::LlmError;

/// Minimal SSE parser.
///
/// - Collects UTF-8 lines
/// - Emits the joined `data:` payload when a blank line ends an event
/// - Ignores `event:`, `id:`, `retry:` and comments
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    cur_data: String,
}

impl SseParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, LlmError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }

            if line.is_empty() {
                if let Some(data) = self.take_event() {
                    out.push(Ok(data));
                }
                continue;
            }

            match std::str::from_utf8(&line) {
                Ok(s) => self.field(s),
                Err(e) => out.push(Err(LlmError::Streaming(format!(
                    "SSE line is not valid UTF-8: {e}"
                )))),
            }
        }

        out
    }

    /// Flushes an event left open when the body ends without a blank line.
    pub(crate) fn finish(&mut self) -> Option<Result<String, LlmError>> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            match String::from_utf8(rest) {
                Ok(s) => self.field(s.trim_end_matches('\r')),
                Err(e) => {
                    return Some(Err(LlmError::Streaming(format!(
                        "SSE line is not valid UTF-8: {e}"
                    ))))
                }
            }
        }
        self.take_event().map(Ok)
    }

    fn field(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("data:") {
            // SSE allows one optional leading space.
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            self.cur_data.push_str(rest);
            self.cur_data.push('\n');
        }
    }

    fn take_event(&mut self) -> Option<String> {
        if self.cur_data.is_empty() {
            return None;
        }
        if self.cur_data.ends_with('\n') {
            self.cur_data.pop();
        }
        Some(std::mem::take(&mut self.cur_data))
    }
}

/// Adapts a byte stream into a stream of SSE `data` payloads.
pub(crate) struct SseStream<B> {
    inner: BoxStream<'static, Result<B, LlmError>>,
    parser: SseParser,
    pending: VecDeque<Result<String, LlmError>>,
    done: bool,
}

impl<B> SseStream<B> {
    pub(crate) fn new(inner: BoxStream<'static, Result<B, LlmError>>) -> Self {
        Self {
            inner,
            parser: SseParser::default(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<B: AsRef<[u8]>> Stream for SseStream<B> {
    type Item = Result<String, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(ev) = this.pending.pop_front() {
                return Poll::Ready(Some(ev));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => this.pending.extend(this.parser.push(bytes.as_ref())),
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    this.pending.extend(this.parser.finish());
                }
            }
        }
    }
}

/// SSE payload stream over an HTTP response body.
pub(crate) fn data_stream(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static {
    use tokio_stream::StreamExt;

    let body = resp.bytes_stream().map(|r| r.map_err(LlmError::from));
    SseStream::new(Box::pin(body))
}
