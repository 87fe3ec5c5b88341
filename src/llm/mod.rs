//! Anthropic Messages API client.

mod client;
mod types;

pub use client::LlmClient;
pub use types::{ContentBlock, Message, MessageRole, MessagesRequest, MessagesResponse, Usage};
