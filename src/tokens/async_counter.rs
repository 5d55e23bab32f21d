use parking_lot::{Mutex, RwLock};

use super::counter::{CountMode, TokenCounter};
use crate::error::LlmError;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    prompt: i64,
    completion: i64,
}

/// Buffers streamed text and counts it once, on demand.
///
/// `append` only buffers; the (possibly expensive) count runs in
/// `finally_calc`. `count` stays 0 until then.
#[derive(Debug)]
pub struct AsyncTokenCounter {
    counter: TokenCounter,
    buffer: Mutex<String>,
    counts: RwLock<Counts>,
}

impl AsyncTokenCounter {
    pub fn new(mode: CountMode, model: &str) -> Result<Self, LlmError> {
        Ok(Self::with_counter(TokenCounter::new(mode, model)?))
    }

    pub fn cl100k() -> Result<Self, LlmError> {
        Ok(Self::with_counter(TokenCounter::cl100k()?))
    }

    /// The exact cl100k counter, or the rune counter when no encoding loads.
    pub fn cl100k_or_rune() -> Self {
        Self::cl100k().unwrap_or_else(|err| {
            tracing::debug!(error = %err, "tokenizer unavailable, counting by rune");
            Self::with_counter(TokenCounter::rune())
        })
    }

    pub fn with_counter(counter: TokenCounter) -> Self {
        Self {
            counter,
            buffer: Mutex::new(String::new()),
            counts: RwLock::new(Counts::default()),
        }
    }

    pub(crate) fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.lock().push_str(chunk);
    }

    pub fn set_prompt_count(&self, count: i64) {
        self.counts.write().prompt = count;
    }

    pub fn prompt_count(&self) -> i64 {
        self.counts.read().prompt
    }

    /// Last finalized completion count.
    pub fn count(&self) -> i64 {
        self.counts.read().completion
    }

    pub fn total_count(&self) -> i64 {
        let counts = self.counts.read();
        counts.prompt + counts.completion
    }

    pub fn count_prompt_messages<S: AsRef<str>>(&self, messages: &[S]) -> i64 {
        self.counter.count_messages(messages) as i64
    }

    /// Counts the whole buffer and stores the result.
    pub fn finally_calc(&self) -> i64 {
        let text = self.buffer.lock().clone();
        if !text.is_empty() {
            let count = self.counter.count(&text) as i64;
            self.counts.write().completion = count;
        }
        self.count()
    }

    pub fn close(&self) {
        self.counter.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_zero_until_finally_calc() {
        let counter = AsyncTokenCounter::new(CountMode::Rune, "").unwrap();
        counter.append("Hello ");
        counter.append("world!");
        assert_eq!(counter.count(), 0);

        // "Hello world!" is 12 chars
        assert_eq!(counter.finally_calc(), 9);
        assert_eq!(counter.count(), 9);
    }

    #[test]
    fn finally_calc_is_idempotent() {
        let counter = AsyncTokenCounter::new(CountMode::Rune, "").unwrap();
        counter.append("This is a response");
        let first = counter.finally_calc();
        assert_eq!(counter.finally_calc(), first);
    }

    #[test]
    fn empty_buffer_counts_zero() {
        let counter = AsyncTokenCounter::new(CountMode::Rune, "").unwrap();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.finally_calc(), 0);
    }

    #[test]
    fn total_is_prompt_plus_completion() {
        let counter = AsyncTokenCounter::new(CountMode::Rune, "").unwrap();
        let prompt = counter.count_prompt_messages(&["Hello", "world"]);
        assert!(prompt > 0);
        counter.set_prompt_count(prompt);
        assert_eq!(counter.prompt_count(), prompt);

        counter.append("This is a response");
        let completion = counter.finally_calc();
        assert!(completion > 0);
        assert_eq!(counter.total_count(), counter.prompt_count() + completion);
    }

    #[test]
    fn tokenizer_mode_counts_appended_text() {
        let counter = AsyncTokenCounter::new(CountMode::Tokenizer, "gpt-3.5-turbo").unwrap();
        counter.append("Hello ");
        counter.append("world! ");
        counter.append("This is a test.");
        assert!(counter.finally_calc() > 0);
        counter.close();
    }

    #[test]
    fn concurrent_appends_are_all_buffered() {
        let counter = std::sync::Arc::new(AsyncTokenCounter::with_counter(TokenCounter::rune()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counter.append("abcd");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 1600 chars * 3 / 4
        assert_eq!(counter.finally_calc(), 1200);
    }
}
