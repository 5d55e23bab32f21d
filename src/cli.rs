use clap::Parser;

/// Chat with an OpenAI-compatible or Gemini model
#[derive(Debug, Parser)]
#[command(name = "llm-bridge")]
#[command(version)]
#[command(about = "Stream a chat reply from an LLM provider", long_about = None)]
pub struct Args {
    /// Provider: "openai" or "google" (default: config/provider or "openai")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    /// Model name
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// System instruction sent before the prompt
    #[arg(short = 's', long = "system")]
    pub system: Option<String>,

    /// Upper bound on generated tokens (0 = provider default)
    #[arg(long = "max-tokens")]
    pub max_tokens: Option<i64>,

    #[arg(long = "temperature")]
    pub temperature: Option<f32>,

    #[arg(long = "top-p")]
    pub top_p: Option<f32>,

    /// Ignored by OpenAI
    #[arg(long = "top-k")]
    pub top_k: Option<u32>,

    /// Wait for the whole reply instead of printing fragments
    #[arg(long = "no-stream")]
    pub no_stream: bool,

    /// Correlation id attached to log lines
    #[arg(long = "trace-id")]
    pub trace_id: Option<String>,

    /// Prompt text (positional)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sampling_flags_and_prompt() {
        let args = Args::try_parse_from([
            "llm-bridge",
            "--provider",
            "google",
            "--temperature",
            "0",
            "--top-k",
            "40",
            "--no-stream",
            "hello",
            "there",
        ])
        .unwrap();
        assert_eq!(args.provider.as_deref(), Some("google"));
        assert_eq!(args.temperature, Some(0.0));
        assert_eq!(args.top_p, None);
        assert_eq!(args.top_k, Some(40));
        assert!(args.no_stream);
        assert_eq!(args.prompt, vec!["hello", "there"]);
    }
}
