//! LLM client traits, concrete providers, and per-node translation proxies.
//!
//! This crate provides:
//!
//! - [`ChatModel`] — the minimal, provider-agnostic trait nodes call against.
//! - [`AnthropicClient`] / [`OpenAiClient`] — concrete HTTP clients.
//! - [`Proxy`] and its two implementations ([`PassthroughProxy`], [`TransformProxy`]) — the
//!   per-node HTTP processes that a terminal-CLI child process talks to instead of the
//!   real upstream, so the proxy manager can swap providers without the child noticing.
//!
//! The wire formats of specific providers are deliberately not exhaustive; only the
//! request/response shapes and the streaming SSE pass-through matter as interfaces.

pub mod client;
pub mod error;
pub mod providers;
pub mod proxy;
mod sse;
pub mod types;

pub use client::{ChatModel, StreamChunk};
pub use error::{LlmError, Result};
pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use proxy::{ApiFormat, PassthroughProxy, Proxy, ProxyConfig, ProxyHandle, TransformProxy};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, MessageRole, ToolCall, ToolDefinition,
    Usage,
};
