//! Local token counting, used when a provider omits usage.

mod async_counter;
mod counter;

pub use async_counter::AsyncTokenCounter;
pub use counter::{CountMode, TokenCounter, MESSAGE_OVERHEAD};
