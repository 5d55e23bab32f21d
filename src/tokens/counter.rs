use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::CoreBPE;

use crate::error::LlmError;

/// Fixed framing cost added per chat message.
pub const MESSAGE_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    /// `chars * 3 / 4`, no tokenizer state.
    #[default]
    Rune,
    /// Exact BPE count for the model's encoding.
    Tokenizer,
}

impl FromStr for CountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rune" => Ok(Self::Rune),
            "tokenizer" => Ok(Self::Tokenizer),
            other => Err(format!("unknown count mode: {other}")),
        }
    }
}

/// Loaded encodings, built at most once per process.
static ENCODINGS: OnceLock<Mutex<HashMap<Tokenizer, Arc<CoreBPE>>>> = OnceLock::new();

fn shared_encoding(tokenizer: Tokenizer) -> Result<Arc<CoreBPE>, LlmError> {
    let mut cache = ENCODINGS.get_or_init(Mutex::default).lock();
    if let Some(bpe) = cache.get(&tokenizer) {
        return Ok(Arc::clone(bpe));
    }
    let bpe = tiktoken_rs::get_bpe_from_tokenizer(tokenizer)
        .map(Arc::new)
        .map_err(|_| LlmError::UnsupportedModel(format!("{tokenizer:?}")))?;
    tracing::debug!(?tokenizer, "loaded encoding");
    cache.insert(tokenizer, Arc::clone(&bpe));
    Ok(bpe)
}

/// Synchronous text to token-count estimator.
pub struct TokenCounter {
    mode: CountMode,
    encoding: RwLock<Option<Arc<CoreBPE>>>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("mode", &self.mode)
            .field("encoding", &self.encoding.read().is_some())
            .finish()
    }
}

impl TokenCounter {
    /// Builds a counter. `model` only matters in tokenizer mode, where a model
    /// without a known encoding yields `LlmError::UnsupportedModel`.
    pub fn new(mode: CountMode, model: &str) -> Result<Self, LlmError> {
        let encoding = match mode {
            CountMode::Rune => None,
            CountMode::Tokenizer => {
                let tokenizer = get_tokenizer(model)
                    .ok_or_else(|| LlmError::UnsupportedModel(model.to_string()))?;
                Some(shared_encoding(tokenizer)?)
            }
        };
        Ok(Self {
            mode,
            encoding: RwLock::new(encoding),
        })
    }

    pub fn rune() -> Self {
        Self {
            mode: CountMode::Rune,
            encoding: RwLock::new(None),
        }
    }

    /// Tokenizer counter on the cl100k encoding, independent of model name.
    pub fn cl100k() -> Result<Self, LlmError> {
        Ok(Self {
            mode: CountMode::Tokenizer,
            encoding: RwLock::new(Some(shared_encoding(Tokenizer::Cl100kBase)?)),
        })
    }

    pub fn mode(&self) -> CountMode {
        self.mode
    }

    /// The loaded encoding; `None` in rune mode or after `close`.
    pub(crate) fn encoding(&self) -> Option<Arc<CoreBPE>> {
        self.encoding.read().clone()
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.mode {
            CountMode::Rune => count_by_rune(text),
            CountMode::Tokenizer => self
                .encoding
                .read()
                .as_ref()
                .map_or(0, |bpe| bpe.encode_with_special_tokens(text).len()),
        }
    }

    /// Sum of per-message counts plus `MESSAGE_OVERHEAD` per message.
    pub fn count_messages<S: AsRef<str>>(&self, messages: &[S]) -> usize {
        let body: usize = messages.iter().map(|m| self.count(m.as_ref())).sum();
        body + messages.len() * MESSAGE_OVERHEAD
    }

    /// Releases this counter's handle on the encoding; a no-op in rune mode.
    pub fn close(&self) {
        self.encoding.write().take();
    }
}

fn count_by_rune(text: &str) -> usize {
    text.chars().count() * 3 / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rune_counts() {
        let counter = TokenCounter::rune();
        let cases = [("", 0), ("Hello world", 8), ("Hello 世界", 6), ("a", 0)];
        for (text, want) in cases {
            assert_eq!(counter.count(text), want, "text: {text:?}");
        }
    }

    #[test]
    fn count_mode_parses_config_names() {
        assert_eq!("rune".parse::<CountMode>(), Ok(CountMode::Rune));
        assert_eq!("tokenizer".parse::<CountMode>(), Ok(CountMode::Tokenizer));
        assert!("bpe".parse::<CountMode>().is_err());
    }

    #[test]
    fn count_messages_adds_framing_overhead() {
        let counter = TokenCounter::rune();
        let messages = ["Hello world", "How are you?", "I'm fine, thank you!"];
        let body: usize = messages.iter().map(|m| counter.count(m)).sum();
        assert_eq!(counter.count_messages(&messages), body + 3 * MESSAGE_OVERHEAD);
        assert_eq!(counter.count_messages::<&str>(&[]), 0);
    }

    #[test]
    fn tokenizer_counts_are_positive() {
        let counter = TokenCounter::new(CountMode::Tokenizer, "gpt-3.5-turbo").unwrap();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("Hello world") > 0);
        assert!(counter.count("Hello 世界! This is a test.") > 0);
    }

    #[test]
    fn unsupported_model_fails_construction() {
        let err = TokenCounter::new(CountMode::Tokenizer, "unsupported-model").unwrap_err();
        assert_eq!(err, LlmError::UnsupportedModel("unsupported-model".into()));
    }

    #[test]
    fn close_releases_encoder() {
        let counter = TokenCounter::cl100k().unwrap();
        assert!(counter.count("Hello world") > 0);
        counter.close();
        assert_eq!(counter.count("Hello world"), 0);

        let rune = TokenCounter::rune();
        rune.close();
        assert_eq!(rune.count("Hello world"), 8);
    }

    #[test]
    fn counters_share_one_encoding_per_tokenizer() {
        let a = TokenCounter::new(CountMode::Tokenizer, "gpt-4o-mini").unwrap();
        let b = TokenCounter::new(CountMode::Tokenizer, "gpt-4o").unwrap();
        assert!(Arc::ptr_eq(&a.encoding().unwrap(), &b.encoding().unwrap()));

        let c = TokenCounter::cl100k().unwrap();
        let d = TokenCounter::new(CountMode::Tokenizer, "gpt-3.5-turbo").unwrap();
        assert!(Arc::ptr_eq(&c.encoding().unwrap(), &d.encoding().unwrap()));

        // Closing one counter leaves the shared encoding usable by others.
        c.close();
        assert!(c.encoding().is_none());
        assert!(d.count("Hello world") > 0);
    }
}
