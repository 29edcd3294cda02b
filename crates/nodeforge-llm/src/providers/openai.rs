//! OpenAI Chat Completions API client, and the message/tool translation used by
//! [`crate::proxy::TransformProxy`] to bridge an Anthropic-speaking child process to an
//! OpenAI-format upstream.

use crate::client::{ChatModel, StreamChunk};
use crate::error::{LlmError, Result};
use crate::sse::SseDecoder;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, MessageRole, ToolCall, Usage,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
}

fn role_to_wire(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Drives a raw `text/event-stream` body of `chat.completion.chunk` objects into
/// [`StreamChunk`]s. OpenAI has no typed terminal event — the stream just ends with a
/// `data: [DONE]` line (or the connection closing) — so `Done` is assembled from the
/// accumulated delta text once that sentinel arrives. Tool calls aren't carried in
/// streaming mode; tool-driven nodes should call `chat` instead.
fn decode_stream<S, B>(bytes: S, model: String) -> BoxStream<'static, Result<StreamChunk>>
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
                let chunk: WireStreamChunk = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let Some(choice) = chunk.choices.into_iter().next() else { continue };
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    state.content.push_str(&text);
                    return Some((Ok(StreamChunk::Delta(text)), state));
                }
                if choice.finish_reason.is_some() {
                    continue;
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

/// Translate an Anthropic-shaped [`ChatMessage`] list into OpenAI wire messages.
/// Exposed for [`crate::proxy::TransformProxy`], which needs the same conversion
/// outside of a full client round trip.
pub fn messages_to_wire(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": role_to_wire(m.role),
                "content": m.content,
                "tool_call_id": m.tool_call_id,
            })
        })
        .collect()
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: role_to_wire(m.role).to_string(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect();

        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        let mut body: WireResponse = resp.json().await.map_err(LlmError::Network)?;
        let choice = body
            .choices
            .pop()
            .ok_or_else(|| LlmError::Api("no choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: Vec::<ToolCall>::new(),
            model: body.model,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: body
                .usage
                .map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: role_to_wire(m.role).to_string(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect();

        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        Ok(Box::pin(decode_stream(resp.bytes_stream(), request.model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_to_wire_preserves_role_and_tool_call_id() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::tool_result("call_7", "result"),
        ];
        let wire = messages_to_wire(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["tool_call_id"], "call_7");
    }

    #[test]
    fn finish_reason_maps_tool_calls() {
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }
}
