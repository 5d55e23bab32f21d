//! Google GenAI (Gemini) via `v1beta/models/{model}:streamGenerateContent`.

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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";

#[derive(Debug, Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    auth: GoogleAuth,
    api_base: Url,
    count_mode: CountMode,
}

#[derive(Debug, Clone)]
pub enum GoogleAuth {
    ApiKey(String),
    BearerToken(String),
}

impl GoogleClient {
    pub fn new(http: reqwest::Client, auth: GoogleAuth) -> Result<Self, LlmError> {
        Self::with_base_url(http, auth, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        auth: GoogleAuth,
        base_url: &str,
    ) -> Result<Self, LlmError> {
        let base = base_url.trim();
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let api_base =
            Url::parse(&base).map_err(|e| LlmError::Config(format!("invalid base url {base}: {e}")))?;
        Ok(Self {
            http,
            auth,
            api_base,
            count_mode: CountMode::Tokenizer,
        })
    }

    #[must_use]
    pub fn with_count_mode(mut self, mode: CountMode) -> Self {
        self.count_mode = mode;
        self
    }

    fn build_url(&self, model: &str) -> Result<Url, LlmError> {
        // alt=sse switches the response to server-sent events.
        let mut url = self
            .api_base
            .join(&format!("v1beta/models/{model}:streamGenerateContent"))
            .map_err(|e| LlmError::Config(format!("invalid model path {model}: {e}")))?;

        if let GoogleAuth::ApiKey(key) = &self.auth {
            url.query_pairs_mut().append_pair("key", key);
        }
        url.query_pairs_mut().append_pair("alt", "sse");
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let GoogleAuth::BearerToken(tok) = &self.auth {
            let v = HeaderValue::from_str(&format!("Bearer {tok}"))
                .map_err(|e| LlmError::Config(format!("invalid bearer token: {e}")))?;
            h.insert(AUTHORIZATION, v);
        }
        Ok(h)
    }
}

#[async_trait]
impl LlmClient for GoogleClient {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        req: ChatRequest,
    ) -> Result<Box<dyn ChatStream>, LlmError> {
        let start = Instant::now();
        let (body, prompt_messages) = convert::build_request(&req)?;

        let counter = driver::local_counter(self.count_mode, &req.model);
        counter.set_prompt_count(counter.count_prompt_messages(&prompt_messages));

        let request = self
            .http
            .post(self.build_url(&req.model)?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, ToolChoice};

    #[test]
    fn api_key_goes_into_the_query() {
        let c = GoogleClient::new(reqwest::Client::new(), GoogleAuth::ApiKey("k1".into())).unwrap();
        let url = c.build_url("gemini-2.5-flash").unwrap();
        assert_eq!(
            url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?key=k1&alt=sse"
        );
        assert!(c.headers().unwrap().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn bearer_token_goes_into_the_header() {
        let c = GoogleClient::with_base_url(
            reqwest::Client::new(),
            GoogleAuth::BearerToken("tok".into()),
            "http://localhost:9000",
        )
        .unwrap();
        let url = c.build_url("gemini-2.5-pro").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(c.headers().unwrap()[AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn undeclared_forced_tool_is_rejected_up_front() {
        let c = GoogleClient::with_base_url(
            reqwest::Client::new(),
            GoogleAuth::ApiKey("k".into()),
            "http://127.0.0.1:9",
        )
        .unwrap();
        let req = ChatRequest {
            model: "gemini-2.5-flash".into(),
            messages: vec![Message::user("hi")],
            tool_choice: Some(ToolChoice::Force {
                name: Some("lookup_weather".into()),
            }),
            ..ChatRequest::default()
        };
        match c.chat_stream(&CancellationToken::new(), req).await {
            Ok(_) => panic!("stream should not start"),
            Err(err) => assert!(matches!(err, LlmError::InvalidToolChoice(_))),
        }
    }
}
