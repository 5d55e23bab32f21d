use anyhow::Context;
use llm_bridge::tokens::CountMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default provider: "openai" or "google"
    pub provider: Option<String>,

    /// Default model (optional)
    pub model: Option<String>,

    /// Default completion token limit
    pub max_tokens: Option<i64>,

    /// Local token counting when the provider reports no usage
    pub count_mode: Option<CountMode>,

    #[serde(default)]
    pub openai: ProviderSection,

    #[serde(default)]
    pub google: ProviderSection,
}

/// Credentials and endpoint for one provider.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSection")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_sections() {
        let cfg: Config = toml::from_str(
            r#"
provider = "google"
model = "gemini-2.5-flash"
count_mode = "tokenizer"

[google]
api_key = "k1"

[openai]
base_url = "http://localhost:8080/v1"
"#,
        )
        .unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("google"));
        assert_eq!(cfg.count_mode, Some(CountMode::Tokenizer));
        assert_eq!(cfg.google.api_key.as_deref(), Some("k1"));
        assert!(cfg.openai.api_key.is_none());
        assert_eq!(cfg.openai.base_url.as_deref(), Some("http://localhost:8080/v1"));
    }

    #[test]
    fn debug_output_hides_api_keys() {
        let cfg = Config {
            openai: ProviderSection {
                api_key: Some("sk-secret".into()),
                base_url: Some("http://localhost:8080/v1".into()),
            },
            ..Config::default()
        };
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("<redacted>"));
        assert!(shown.contains("http://localhost:8080/v1"));
    }

    #[test]
    fn missing_file_is_none() {
        let path = std::env::temp_dir().join("llm-bridge-missing-config.toml");
        assert!(Config::load_optional(path).unwrap().is_none());
    }
}
