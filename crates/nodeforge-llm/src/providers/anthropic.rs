//! Anthropic Messages API client.
//!
//! Only the request/response shape needed to drive a [`crate::ChatModel`] is modeled;
//! the exact wire format is an external collaborator's concern (terminal CLIs speak it
//! natively and the pass-through proxy forwards it verbatim without touching this client).

use crate::client::{ChatModel, StreamChunk};
use crate::error::{LlmError, Result};
use crate::sse::SseDecoder;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, MessageRole, Usage};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct AnthropicClient {
    config: AnthropicConfig,
    http: Client,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn convert_messages(&self, messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut wire = Vec::with_capacity(messages.len());
        for m in messages {
            match m.role {
                MessageRole::System => {
                    system = Some(match system {
                        Some(existing) => format!("{existing}\n\n{}", m.content),
                        None => m.content.clone(),
                    });
                }
                MessageRole::User | MessageRole::Tool => wire.push(WireMessage {
                    role: "user".to_string(),
                    content: m.content.clone(),
                }),
                MessageRole::Assistant => wire.push(WireMessage {
                    role: "assistant".to_string(),
                    content: m.content.clone(),
                }),
            }
        }
        (system, wire)
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<WireContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Drives a raw `text/event-stream` body into [`StreamChunk`]s: a `Delta` per
/// `content_block_delta` event, then one terminal `Done` at `message_stop` (or when
/// the body ends without one, which upstream shouldn't do but a flaky connection
/// might). Usage and tool calls aren't carried in streaming mode; tool-driven nodes
/// should call `chat` instead.
fn decode_message_stream<S, B>(bytes: S, model: String) -> BoxStream<'static, Result<StreamChunk>>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        content: String,
        model: String,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        content: String::new(),
        model,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                if payload == "[DONE]" {
                    continue;
                }
                let event: serde_json::Value = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "content_block_delta" => {
                        if let Some(text) = event.pointer("/delta/text").and_then(|v| v.as_str()) {
                            state.content.push_str(text);
                            return Some((Ok(StreamChunk::Delta(text.to_string())), state));
                        }
                    }
                    "message_stop" => {
                        state.finished = true;
                        let response = ChatResponse {
                            content: std::mem::take(&mut state.content),
                            tool_calls: Vec::new(),
                            model: state.model.clone(),
                            finish_reason: FinishReason::Stop,
                            usage: Usage::default(),
                        };
                        return Some((Ok(StreamChunk::Done(response)), state));
                    }
                    _ => {}
                }
            } else if state.finished {
                return None;
            } else {
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let payloads = state.decoder.feed(chunk.as_ref());
                        state.pending.extend(payloads);
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(LlmError::Network(e)), state));
                    }
                    None => {
                        state.finished = true;
                        let response = ChatResponse {
                            content: std::mem::take(&mut state.content),
                            tool_calls: Vec::new(),
                            model: state.model.clone(),
                            finish_reason: FinishReason::Stop,
                            usage: Usage::default(),
                        };
                        return Some((Ok(StreamChunk::Done(response)), state));
                    }
                }
            }
        }
    }))
}

#[async_trait]
impl ChatModel for AnthropicClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let (system, messages) = self.convert_messages(&request.messages);
        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(4096),
            temperature: request.temperature,
            stream: false,
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        let body: WireResponse = resp.json().await.map_err(LlmError::Network)?;
        let content = body
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.clone())
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
            model: body.model,
            finish_reason: map_stop_reason(body.stop_reason.as_deref()),
            usage: Usage {
                input_tokens: body.usage.input_tokens,
                output_tokens: body.usage.output_tokens,
            },
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let (system, messages) = self.convert_messages(&request.messages);
        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(4096),
            temperature: request.temperature,
            stream: true,
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        Ok(Box::pin(decode_message_stream(resp.bytes_stream(), request.model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new(AnthropicConfig::new("http://localhost", "key"))
    }

    #[test]
    fn convert_messages_merges_system_and_separates_conversation() {
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::system("second"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (system, wire) = client().convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("first\n\nsecond"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
    }

    #[test]
    fn map_stop_reason_recognizes_tool_use() {
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(None), FinishReason::Stop);
    }
}
