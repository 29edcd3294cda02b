//! Per-node LLM proxies (§4.8).
//!
//! A proxy is a small HTTP server bound to a local port that a terminal-CLI child
//! process is pointed at via `ANTHROPIC_BASE_URL`. Two kinds exist:
//!
//! - [`PassthroughProxy`] — `api_format = "anthropic"`. Forwards the request verbatim
//!   to the configured upstream, optionally overriding the model and always replacing
//!   the API key, and logs request/response.
//! - [`TransformProxy`] — `api_format = "openai"`. Bidirectionally translates the
//!   Anthropic-shaped request the child sends into an OpenAI-shaped upstream call.
//!
//! The proxy manager (in `nodeforge-server`) owns the lifecycle; this module only
//! knows how to start, health-check, and stop a single bound server.

use crate::error::{LlmError, Result};
use crate::sse::SseDecoder;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    Anthropic,
    OpenAi,
}

impl ApiFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub api_format: ApiFormat,
    pub base_url: String,
    pub api_key: String,
    /// Required for `openai`; for `anthropic` absent means "preserve the client's model".
    pub model: Option<String>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_format == ApiFormat::OpenAi && self.model.is_none() {
            return Err(LlmError::InvalidRequest(
                "model is required for the openai transform proxy".to_string(),
            ));
        }
        Ok(())
    }
}

/// A running proxy: the port it's bound to and a handle to shut it down.
pub struct ProxyHandle {
    pub port: u16,
    pub url: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyHandle {
    /// Stop the proxy gracefully. In-flight requests are allowed to finish because the
    /// listener stops accepting new connections before the task is awaited.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait::async_trait]
pub trait Proxy: Send + Sync {
    /// Bind to `port` and serve until stopped. Returns once the listener is bound and
    /// actively serving (the caller then health-polls `/healthz`).
    async fn start(config: ProxyConfig, port: u16) -> Result<ProxyHandle>;
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub struct PassthroughProxy;

#[async_trait::async_trait]
impl Proxy for PassthroughProxy {
    async fn start(config: ProxyConfig, port: u16) -> Result<ProxyHandle> {
        let state = Arc::new(config);
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/v1/messages", post(passthrough_handler))
            .with_state(state);
        bind_and_serve(app, port).await
    }
}

async fn passthrough_handler(
    State(config): State<Arc<ProxyConfig>>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    if let Some(model) = &config.model {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(model.clone()));
        }
    }
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    debug!(base_url = %config.base_url, streaming, "forwarding anthropic request verbatim");

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/messages", config.base_url))
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .await;

    match resp {
        Ok(r) => {
            let status = StatusCode::from_u16(r.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            if streaming && status.is_success() {
                // Already Anthropic-shaped SSE; relay the chunks verbatim, no translation needed.
                sse_response(status, r.bytes_stream())
            } else {
                let text = r.text().await.unwrap_or_default();
                (status, text).into_response()
            }
        }
        Err(e) => {
            warn!(error = %e, "passthrough proxy upstream request failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Build an `IntoResponse` that streams raw SSE bytes to the client as they arrive
/// upstream, instead of buffering the whole body first.
fn sse_response<S, B>(status: StatusCode, bytes: S) -> axum::response::Response
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: Into<axum::body::Bytes>,
{
    let body = Body::from_stream(bytes.map(|r| r.map(Into::into)));
    axum::response::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "proxy response build failed").into_response())
}

pub struct TransformProxy;

#[async_trait::async_trait]
impl Proxy for TransformProxy {
    async fn start(config: ProxyConfig, port: u16) -> Result<ProxyHandle> {
        config.validate()?;
        let state = Arc::new(config);
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/v1/messages", post(transform_handler))
            .with_state(state);
        bind_and_serve(app, port).await
    }
}

/// Translate an incoming Anthropic-shaped `{model, system, messages, max_tokens}` body
/// into an OpenAI chat-completion request, call upstream, and translate the response
/// back into the Anthropic content-block shape the child expects.
async fn transform_handler(
    State(config): State<Arc<ProxyConfig>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let model = config.model.clone().unwrap_or_default();
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mut wire_messages = Vec::new();
    if let Some(system) = body.get("system").and_then(Value::as_str) {
        wire_messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for m in messages {
            let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = extract_text(m.get("content"));
            wire_messages.push(serde_json::json!({"role": role, "content": content}));
        }
    }

    let upstream_req = serde_json::json!({
        "model": model,
        "messages": wire_messages,
        "max_tokens": body.get("max_tokens").cloned().unwrap_or(serde_json::json!(4096)),
        "stream": streaming,
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/chat/completions", config.base_url))
        .bearer_auth(&config.api_key)
        .json(&upstream_req)
        .send()
        .await;

    match resp {
        Ok(r) if r.status().is_success() && streaming => {
            let body = Body::from_stream(decode_openai_sse_to_anthropic_sse(r.bytes_stream()));
            axum::response::Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(body)
                .unwrap_or_else(|_| {
                    (StatusCode::INTERNAL_SERVER_ERROR, "proxy response build failed").into_response()
                })
        }
        Ok(r) if r.status().is_success() => match r.json::<Value>().await {
            Ok(upstream_body) => (StatusCode::OK, Json(openai_to_anthropic(upstream_body))).into_response(),
            Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        },
        Ok(r) => {
            let status = StatusCode::from_u16(r.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let text = r.text().await.unwrap_or_default();
            (status, text).into_response()
        }
        Err(e) => {
            warn!(error = %e, "transform proxy upstream request failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Re-frame an OpenAI `chat.completion.chunk` SSE body as Anthropic-shaped SSE events,
/// one `content_block_delta` per text delta and a trailing `message_stop` at `[DONE]`
/// (or when the upstream connection just closes without sending it).
fn decode_openai_sse_to_anthropic_sse<S, B>(
    bytes: S,
) -> BoxStream<'static, std::result::Result<String, LlmError>>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                if payload == "[DONE]" {
                    state.finished = true;
                    let event = serde_json::json!({"type": "message_stop"});
                    return Some((Ok(format!("event: message_stop\ndata: {event}\n\n")), state));
                }
                let value: Value = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let text = value.pointer("/choices/0/delta/content").and_then(Value::as_str);
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    let event = serde_json::json!({
                        "type": "content_block_delta",
                        "delta": {"type": "text_delta", "text": text},
                    });
                    return Some((Ok(format!("event: content_block_delta\ndata: {event}\n\n")), state));
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
                    None => return None,
                }
            }
        }
    }))
}

fn extract_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn openai_to_anthropic(upstream: Value) -> Value {
    let choice = upstream
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let text = choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let stop_reason = match choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str) {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };
    serde_json::json!({
        "content": [{"type": "text", "text": text}],
        "model": upstream.get("model").cloned().unwrap_or(Value::Null),
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": upstream.pointer("/usage/prompt_tokens").cloned().unwrap_or(serde_json::json!(0)),
            "output_tokens": upstream.pointer("/usage/completion_tokens").cloned().unwrap_or(serde_json::json!(0)),
        },
    })
}

async fn bind_and_serve(app: Router, port: u16) -> Result<ProxyHandle> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LlmError::Internal(format!("failed to bind proxy port {port}: {e}")))?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| LlmError::Internal(e.to_string()))?
        .port();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = server.await {
            warn!(error = %e, "proxy server exited with error");
        }
    });

    info!(port = bound_port, "proxy listening");
    Ok(ProxyHandle {
        port: bound_port,
        url: format!("http://127.0.0.1:{bound_port}"),
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

/// Poll `/healthz` until it answers or `timeout` elapses (§4.8 step 3).
pub async fn wait_healthy(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client
            .get(format!("{url}/healthz"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LlmError::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_tool_calls_finish_reason_to_anthropic_stop_reason() {
        let upstream = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5},
        });
        let anthropic = openai_to_anthropic(upstream);
        assert_eq!(anthropic["stop_reason"], "tool_use");
        assert_eq!(anthropic["content"][0]["text"], "hi");
        assert_eq!(anthropic["usage"]["input_tokens"], 3);
    }

    #[test]
    fn extract_text_joins_content_blocks() {
        let blocks = serde_json::json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(extract_text(Some(&blocks)), "ab");
        assert_eq!(extract_text(Some(&Value::String("plain".into()))), "plain");
    }

    #[test]
    fn transform_proxy_rejects_missing_model() {
        let config = ProxyConfig {
            api_format: ApiFormat::OpenAi,
            base_url: "http://localhost".into(),
            api_key: "k".into(),
            model: None,
        };
        assert!(config.validate().is_err());
    }
}
