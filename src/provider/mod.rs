//! Provider adapters behind the `LlmClient` / `ChatStream` contract.

mod attachment;
mod driver;
mod sse;

#[cfg(feature = "google")]
pub mod google;
#[cfg(feature = "openai")]
pub mod openai;

pub use driver::ChannelStream;
#[cfg(feature = "google")]
pub use google::{GoogleAuth, GoogleClient};
#[cfg(feature = "openai")]
pub use openai::OpenAiClient;
