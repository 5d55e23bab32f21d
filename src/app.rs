use crate::{cli, config};
use anyhow::Context;
use llm_bridge::tokens::CountMode;
use llm_bridge::{ChatRequest, LlmClient, Message, SamplingParams};

pub const DEFAULT_PROVIDER: &str = "openai";

fn default_model(provider: &str) -> &'static str {
    match provider {
        "google" => "gemini-2.5-flash",
        _ => "gpt-4o-mini",
    }
}

/// Environment first, then the config section.
fn setting(env_key: &str, from_cfg: Option<&String>) -> Option<String> {
    std::env::var(env_key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| from_cfg.cloned())
}

pub fn build_client(
    http: &reqwest::Client,
    cfg: Option<&config::Config>,
    provider_name: &str,
) -> anyhow::Result<Box<dyn LlmClient>> {
    let count_mode = cfg
        .and_then(|c| c.count_mode)
        .unwrap_or(CountMode::Tokenizer);

    match provider_name {
        "openai" => {
            #[cfg(feature = "openai")]
            {
                let section = cfg.map(|c| &c.openai);
                let api_key = setting("OPENAI_API_KEY", section.and_then(|s| s.api_key.as_ref()));
                let base_url = setting("OPENAI_BASE_URL", section.and_then(|s| s.base_url.as_ref()));

                let client = llm_bridge::provider::OpenAiClient::new(
                    http.clone(),
                    base_url.as_deref(),
                    api_key,
                )
                .context("failed to configure OpenAI client")?
                .with_count_mode(count_mode);
                Ok(Box::new(client))
            }
            #[cfg(not(feature = "openai"))]
            {
                let _ = (http, count_mode);
                anyhow::bail!("openai provider is not enabled in this build")
            }
        }
        "google" => {
            #[cfg(feature = "google")]
            {
                use llm_bridge::provider::google::{GoogleAuth, GoogleClient, DEFAULT_BASE_URL};

                let section = cfg.map(|c| &c.google);
                let api_key = setting("GEMINI_API_KEY", section.and_then(|s| s.api_key.as_ref()))
                    .context("missing API key (set GEMINI_API_KEY or config.toml google.api_key)")?;
                let base_url = setting("GEMINI_BASE_URL", section.and_then(|s| s.base_url.as_ref()));

                let client = GoogleClient::with_base_url(
                    http.clone(),
                    GoogleAuth::ApiKey(api_key),
                    base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                )
                .context("failed to configure Gemini client")?
                .with_count_mode(count_mode);
                Ok(Box::new(client))
            }
            #[cfg(not(feature = "google"))]
            {
                let _ = (http, count_mode);
                anyhow::bail!("google provider is not enabled in this build")
            }
        }
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

/// Turns command line arguments into a request, filling gaps from config.
pub fn build_request(
    args: &cli::Args,
    cfg: Option<&config::Config>,
    provider_name: &str,
) -> anyhow::Result<ChatRequest> {
    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: llm-bridge \"Hello\"");
    }

    let model = args
        .model
        .clone()
        .or_else(|| cfg.and_then(|c| c.model.clone()))
        .unwrap_or_else(|| default_model(provider_name).to_string());

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = args.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));

    Ok(ChatRequest {
        model,
        messages,
        max_tokens: args
            .max_tokens
            .or_else(|| cfg.and_then(|c| c.max_tokens))
            .unwrap_or(0),
        sampling: SamplingParams {
            temperature: args.temperature,
            top_p: args.top_p,
            top_k: args.top_k,
        },
        trace_id: args.trace_id.clone().unwrap_or_default(),
        ..ChatRequest::default()
    })
}
