//! `OpenAI`-compatible chat completions (`/chat/completions` with SSE).

mod convert;
mod protocol;
mod stream;

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use super::driver::{self, StreamLabel};
use super::sse;
use crate::error::LlmError;
use crate::model::{ChatRequest, ChatStream, LlmClient};
use crate::tokens::CountMode;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    count_mode: CountMode,
}

impl OpenAiClient {
    /// `base_url` defaults to the public API; any compatible server works.
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        let base = base_url
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BASE_URL);
        // `Url::join` drops the last path segment unless it ends in a slash.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base_url =
            Url::parse(&base).map_err(|e| LlmError::Config(format!("invalid base url {base}: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            count_mode: CountMode::Tokenizer,
        })
    }

    /// Local counting used when the server does not report usage.
    #[must_use]
    pub fn with_count_mode(mut self, mode: CountMode) -> Self {
        self.count_mode = mode;
        self
    }

    fn endpoint(&self) -> Result<Url, LlmError> {
        self.base_url
            .join("chat/completions")
            .map_err(|e| LlmError::Config(e.to_string()))
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let v = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| LlmError::Config(format!("invalid api key header: {e}")))?;
            h.insert(AUTHORIZATION, v);
        }
        Ok(h)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        req: ChatRequest,
    ) -> Result<Box<dyn ChatStream>, LlmError> {
        let start = Instant::now();
        let (body, prompt_messages) = convert::build_stream_request(&req)?;

        let counter = driver::local_counter(self.count_mode, &req.model);
        counter.set_prompt_count(counter.count_prompt_messages(&prompt_messages));

        let request = self
            .http
            .post(self.endpoint()?)
            .headers(self.headers()?)
            .json(&body);
        let resp = driver::send(cancel, request).await?;

        let label = StreamLabel {
            provider: self.name(),
            model: req.model,
            trace_id: req.trace_id,
        };
        let chunks = stream::decode_chunks(sse::data_stream(resp));
        Ok(Box::new(stream::start_stream(
            cancel, chunks, counter, start, label,
        )))
    }
}
