//! Core trait for chat-based language models.
//!
//! Mirrors the "framework provides traits, callers provide providers" philosophy: the
//! rest of the crate is free to add providers without the node layer caring which one
//! is in play.

use crate::error::Result;
use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A chunk of a streamed chat response. The final chunk in the stream carries the
/// same [`ChatResponse`] shape `execute` would have returned had it not streamed.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Delta(String),
    Done(ChatResponse),
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    async fn stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<StreamChunk>>>;

    /// Cancel an in-flight request. No-op for providers without a cancel primitive.
    fn interrupt(&self) {}
}
