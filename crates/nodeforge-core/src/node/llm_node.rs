//! StatelessLLMNode / StatefulLLMNode (§3.1, §4.4): nodes that call an LLM endpoint.
//!
//! The stateless variant is a single request/response round: no transcript survives
//! between calls. The stateful variant keeps a running [`ChatMessage`] transcript and
//! drives a bounded tool-call loop, delegating actual tool execution to a
//! [`ToolExecutor`] the caller wires in (typically the dispatcher, routing
//! `<node-id>.<tool-name>` calls to other nodes in the session).

use super::{ExecutionContext, Forkable, Node, NodeInfo, NodeResult, NodeState, OutputChunk, ToolCapable};
use crate::error::{NodeError, Result};
use crate::event::{Event, EventType};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use nodeforge_llm::{ChatMessage, ChatModel, ChatRequest, StreamChunk, ToolDefinition};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Turns one upstream [`StreamChunk`] into the node-level [`OutputChunk`] shape,
/// emitting the matching event along the way. Shared by both LLM node variants since
/// neither carries tool calls or usage through the streaming path.
async fn relay_stream_chunk(
    sink: &Arc<dyn crate::event::EventSink>,
    node_id: &str,
    item: nodeforge_llm::Result<StreamChunk>,
) -> OutputChunk {
    match item {
        Ok(StreamChunk::Delta(text)) => {
            sink.emit(
                Event::new(EventType::OutputChunk)
                    .with_node(node_id.to_string())
                    .with_data("delta", text.clone()),
            )
            .await;
            OutputChunk::Delta(text)
        }
        Ok(StreamChunk::Done(response)) => {
            let mut attributes = serde_json::Map::new();
            attributes.insert("content".to_string(), response.content.into());
            attributes.insert(
                "tool_calls".to_string(),
                serde_json::to_value(&response.tool_calls).unwrap_or(Value::Null),
            );
            attributes.insert("model".to_string(), response.model.into());
            attributes.insert(
                "finish_reason".to_string(),
                serde_json::to_value(response.finish_reason).unwrap_or(Value::Null),
            );
            attributes.insert("usage".to_string(), serde_json::to_value(response.usage).unwrap_or(Value::Null));
            sink.emit(Event::new(EventType::OutputParsed).with_node(node_id.to_string())).await;
            OutputChunk::Done(NodeResult::ok(attributes))
        }
        Err(e) => OutputChunk::Done(NodeResult::from_node_error(&e.into())),
    }
}

/// Executes a single tool call by name, returning its stringified result. Implemented
/// by the dispatcher layer to route calls to the owning node (MCP, function, etc.).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, name: &str, args: Value) -> Result<String>;
}

pub struct StatelessLLMNode {
    id: String,
    client: Arc<dyn ChatModel>,
    model: String,
    system_prompt: Option<String>,
    interrupted: AtomicBool,
}

impl StatelessLLMNode {
    pub fn new(id: impl Into<String>, client: Arc<dyn ChatModel>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client,
            model: model.into(),
            system_prompt: None,
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[async_trait]
impl Node for StatelessLLMNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "stateless_llm"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.push(ChatMessage::user(ctx.input.as_text()));
        let request = ChatRequest::new(self.model.clone(), messages);

        self.interrupted.store(false, Ordering::Release);
        match self.client.chat(request).await {
            Ok(response) => {
                if self.interrupted.load(Ordering::Acquire) {
                    return NodeResult::err("operation interrupted", "interrupted");
                }
                let mut attributes = serde_json::Map::new();
                attributes.insert("content".to_string(), response.content.into());
                attributes.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(&response.tool_calls).unwrap_or(Value::Null),
                );
                attributes.insert("model".to_string(), response.model.into());
                attributes.insert(
                    "finish_reason".to_string(),
                    serde_json::to_value(response.finish_reason).unwrap_or(Value::Null),
                );
                attributes.insert(
                    "usage".to_string(),
                    serde_json::to_value(response.usage).unwrap_or(Value::Null),
                );
                attributes.insert("retries".to_string(), 0.into());
                NodeResult::ok(attributes)
            }
            Err(e) => NodeResult::from_node_error(&e.into()),
        }
    }

    async fn execute_stream(&self, ctx: ExecutionContext) -> BoxStream<'static, OutputChunk> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.push(ChatMessage::user(ctx.input.as_text()));
        let request = ChatRequest::new(self.model.clone(), messages);
        self.interrupted.store(false, Ordering::Release);

        let node_id = self.id.clone();
        let sink = ctx.sink.clone();
        match self.client.stream(request).await {
            Ok(chunks) => Box::pin(chunks.then(move |item| {
                let sink = sink.clone();
                let node_id = node_id.clone();
                async move { relay_stream_chunk(&sink, &node_id, item).await }
            })),
            Err(e) => {
                let result = NodeResult::from_node_error(&e.into());
                Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }))
            }
        }
    }

    async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.client.interrupt();
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: NodeState::Ready,
            metadata: Default::default(),
        }
    }
}

struct StatefulState {
    messages: Vec<ChatMessage>,
    tool_rounds: usize,
}

pub struct StatefulLLMNode {
    id: String,
    client: Arc<dyn ChatModel>,
    model: String,
    tools: Vec<ToolDefinition>,
    executor: Option<Arc<dyn ToolExecutor>>,
    max_tool_rounds: Option<usize>,
    state: Mutex<StatefulState>,
    metadata: Mutex<serde_json::Map<String, Value>>,
    interrupted: AtomicBool,
}

impl StatefulLLMNode {
    pub fn new(id: impl Into<String>, client: Arc<dyn ChatModel>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client,
            model: model.into(),
            tools: Vec::new(),
            executor: None,
            max_tool_rounds: None,
            state: Mutex::new(StatefulState {
                messages: Vec::new(),
                tool_rounds: 0,
            }),
            metadata: Mutex::new(serde_json::Map::new()),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        self.state.lock().messages.push(ChatMessage::system(prompt));
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// No default per the policy decision recorded for this loop's bound: callers
    /// that don't set one get an unbounded loop, trusting the upstream tool-call
    /// stream to terminate on its own `finish_reason`.
    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = Some(max_tool_rounds);
        self
    }

    pub fn messages_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Push a message directly into the transcript without a round trip to the
    /// model — used by tests and by callers seeding a fork's starting context.
    pub fn push_message(&self, message: ChatMessage) {
        self.state.lock().messages.push(message);
    }

    /// Deep-copies the transcript and shares the (stateless) client reference (§4.4
    /// "Stateful LLM fork"). Returns the concrete type so callers that already know
    /// they're forking a stateful LLM node don't need to downcast the trait object.
    pub fn fork_stateful(&self, new_id: String) -> Self {
        let state = self.state.lock();
        let messages = state.messages.clone();
        let fork_point = state.messages.len();
        drop(state);

        let mut metadata = serde_json::Map::new();
        metadata.insert("forked_from".to_string(), self.id.clone().into());
        metadata.insert("fork_point_messages".to_string(), fork_point.into());

        Self {
            id: new_id,
            client: self.client.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            executor: self.executor.clone(),
            max_tool_rounds: self.max_tool_rounds,
            state: Mutex::new(StatefulState {
                messages,
                tool_rounds: 0,
            }),
            metadata: Mutex::new(metadata),
            interrupted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Node for StatefulLLMNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "stateful_llm"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        {
            let mut state = self.state.lock();
            state.messages.push(ChatMessage::user(ctx.input.as_text()));
        }
        self.interrupted.store(false, Ordering::Release);

        let mut rounds = 0usize;
        loop {
            let (messages, exceeded) = {
                let state = self.state.lock();
                let exceeded = self
                    .max_tool_rounds
                    .map(|max| state.tool_rounds >= max)
                    .unwrap_or(false);
                (state.messages.clone(), exceeded)
            };

            if exceeded {
                break;
            }

            let request = ChatRequest::new(self.model.clone(), messages).with_tools(self.tools.clone());
            let response = match self.client.chat(request).await {
                Ok(r) => r,
                Err(e) => return NodeResult::from_node_error(&e.into()),
            };

            if self.interrupted.load(Ordering::Acquire) {
                return NodeResult::err("operation interrupted", "interrupted");
            }

            if response.tool_calls.is_empty() || self.executor.is_none() {
                let mut state = self.state.lock();
                state.messages.push(ChatMessage::assistant(response.content.clone()));
                let messages_count = state.messages.len();
                let tool_rounds = state.tool_rounds;
                drop(state);

                let mut attributes = serde_json::Map::new();
                attributes.insert("content".to_string(), response.content.into());
                attributes.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(&response.tool_calls).unwrap_or(Value::Null),
                );
                attributes.insert(
                    "usage".to_string(),
                    serde_json::to_value(response.usage).unwrap_or(Value::Null),
                );
                attributes.insert("messages_count".to_string(), messages_count.into());
                attributes.insert("tool_rounds".to_string(), tool_rounds.into());
                return NodeResult::ok(attributes);
            }

            let executor = self.executor.as_ref().expect("checked above");
            let mut assistant_msg = ChatMessage::assistant(response.content.clone());
            assistant_msg.tool_calls = response.tool_calls.clone();
            self.state.lock().messages.push(assistant_msg);

            for call in &response.tool_calls {
                let result = match executor.call(&call.name, call.arguments.clone()).await {
                    Ok(text) => text,
                    Err(e) => format!("error: {e}"),
                };
                self.state
                    .lock()
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), result));
            }

            rounds += 1;
            self.state.lock().tool_rounds = rounds;
        }

        let state = self.state.lock();
        let mut attributes = serde_json::Map::new();
        attributes.insert("content".to_string(), Value::String(String::new()));
        attributes.insert("tool_calls".to_string(), Value::Array(Vec::new()));
        attributes.insert(
            "usage".to_string(),
            serde_json::to_value(nodeforge_llm::Usage::default()).unwrap_or(Value::Null),
        );
        attributes.insert("messages_count".to_string(), state.messages.len().into());
        attributes.insert("tool_rounds".to_string(), state.tool_rounds.into());
        NodeResult::ok(attributes)
    }

    /// Tool-invoking rounds still need a full response to read `tool_calls` off of, so
    /// they run through the blocking `chat` call same as `execute`; only the final
    /// round — the one that actually produces user-facing text — streams.
    async fn execute_stream(&self, ctx: ExecutionContext) -> BoxStream<'static, OutputChunk> {
        {
            let mut state = self.state.lock();
            state.messages.push(ChatMessage::user(ctx.input.as_text()));
        }
        self.interrupted.store(false, Ordering::Release);

        loop {
            let (messages, exceeded) = {
                let state = self.state.lock();
                let exceeded = self
                    .max_tool_rounds
                    .map(|max| state.tool_rounds >= max)
                    .unwrap_or(false);
                (state.messages.clone(), exceeded)
            };

            if exceeded {
                break;
            }

            let request = ChatRequest::new(self.model.clone(), messages).with_tools(self.tools.clone());

            if self.tools.is_empty() || self.executor.is_none() {
                let node_id = self.id.clone();
                let sink = ctx.sink.clone();
                return match self.client.stream(request).await {
                    Ok(chunks) => Box::pin(chunks.then(move |item| {
                        let sink = sink.clone();
                        let node_id = node_id.clone();
                        async move { relay_stream_chunk(&sink, &node_id, item).await }
                    })),
                    Err(e) => {
                        let result = NodeResult::from_node_error(&e.into());
                        Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }))
                    }
                };
            }

            let response = match self.client.chat(request).await {
                Ok(r) => r,
                Err(e) => {
                    let result = NodeResult::from_node_error(&e.into());
                    return Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }));
                }
            };

            if self.interrupted.load(Ordering::Acquire) {
                let result = NodeResult::err("operation interrupted", "interrupted");
                return Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }));
            }

            if response.tool_calls.is_empty() {
                let mut state = self.state.lock();
                state.messages.push(ChatMessage::assistant(response.content.clone()));
                let messages_count = state.messages.len();
                let tool_rounds = state.tool_rounds;
                drop(state);

                let mut attributes = serde_json::Map::new();
                attributes.insert("content".to_string(), response.content.into());
                attributes.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(&response.tool_calls).unwrap_or(Value::Null),
                );
                attributes.insert("usage".to_string(), serde_json::to_value(response.usage).unwrap_or(Value::Null));
                attributes.insert("messages_count".to_string(), messages_count.into());
                attributes.insert("tool_rounds".to_string(), tool_rounds.into());
                let result = NodeResult::ok(attributes);
                return Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }));
            }

            let executor = self.executor.as_ref().expect("checked above");
            let mut assistant_msg = ChatMessage::assistant(response.content.clone());
            assistant_msg.tool_calls = response.tool_calls.clone();
            self.state.lock().messages.push(assistant_msg);

            for call in &response.tool_calls {
                let result = match executor.call(&call.name, call.arguments.clone()).await {
                    Ok(text) => text,
                    Err(e) => format!("error: {e}"),
                };
                self.state
                    .lock()
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), result));
            }

            let rounds = self.state.lock().tool_rounds + 1;
            self.state.lock().tool_rounds = rounds;
        }

        let state = self.state.lock();
        let mut attributes = serde_json::Map::new();
        attributes.insert("content".to_string(), Value::String(String::new()));
        attributes.insert("tool_calls".to_string(), Value::Array(Vec::new()));
        attributes.insert(
            "usage".to_string(),
            serde_json::to_value(nodeforge_llm::Usage::default()).unwrap_or(Value::Null),
        );
        attributes.insert("messages_count".to_string(), state.messages.len().into());
        attributes.insert("tool_rounds".to_string(), state.tool_rounds.into());
        let result = NodeResult::ok(attributes);
        drop(state);
        Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }))
    }

    async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.client.interrupt();
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: NodeState::Ready,
            metadata: self.metadata.lock().clone(),
        }
    }

    async fn try_fork(&self, new_id: String) -> Result<Arc<dyn Node>> {
        Forkable::fork(self, new_id).await
    }
}

#[async_trait]
impl ToolCapable for StatefulLLMNode {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn call_tool(&self, name: &str, _args: Value) -> Result<String> {
        Err(NodeError::NotImplemented(format!(
            "stateful LLM node does not execute its own tools: {name}"
        )))
    }
}

#[async_trait]
impl Forkable for StatefulLLMNode {
    async fn fork(&self, new_id: String) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(self.fork_stateful(new_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_llm::{ChatResponse, FinishReason, StreamChunk, Usage};
    use futures::stream::BoxStream;

    struct StubClient {
        reply: String,
    }

    #[async_trait]
    impl ChatModel for StubClient {
        async fn chat(&self, request: ChatRequest) -> nodeforge_llm::Result<ChatResponse> {
            Ok(ChatResponse {
                content: format!("{}:{}", self.reply, request.messages.len()),
                tool_calls: Vec::new(),
                model: request.model,
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            })
        }

        async fn stream(
            &self,
            _request: ChatRequest,
        ) -> nodeforge_llm::Result<BoxStream<'static, nodeforge_llm::Result<StreamChunk>>> {
            unimplemented!("not exercised in these tests")
        }
    }

    struct StreamingStubClient {
        deltas: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatModel for StreamingStubClient {
        async fn chat(&self, request: ChatRequest) -> nodeforge_llm::Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.deltas.concat(),
                tool_calls: Vec::new(),
                model: request.model,
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            })
        }

        async fn stream(
            &self,
            request: ChatRequest,
        ) -> nodeforge_llm::Result<BoxStream<'static, nodeforge_llm::Result<StreamChunk>>> {
            let mut items: Vec<nodeforge_llm::Result<StreamChunk>> = self
                .deltas
                .iter()
                .map(|d| Ok(StreamChunk::Delta(d.to_string())))
                .collect();
            items.push(Ok(StreamChunk::Done(ChatResponse {
                content: self.deltas.concat(),
                tool_calls: Vec::new(),
                model: request.model,
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            })));
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn stateless_node_returns_single_round_response() {
        let client = Arc::new(StubClient { reply: "hi".to_string() });
        let node = StatelessLLMNode::new("l1", client, "test-model");
        let result = node.execute(ExecutionContext::new("hello")).await;
        assert!(result.success);
        assert_eq!(result.attributes["content"], "hi:1");
    }

    #[tokio::test]
    async fn stateful_fork_has_independent_transcript() {
        let client = Arc::new(StubClient { reply: "ok".to_string() });
        let node = StatefulLLMNode::new("a", client, "test-model");
        node.push_message(ChatMessage::user("1"));
        node.push_message(ChatMessage::user("2"));
        node.push_message(ChatMessage::user("3"));
        assert_eq!(node.messages_count(), 3);

        let forked = node.fork_stateful("b".to_string());
        forked.push_message(ChatMessage::user("4"));

        assert_eq!(node.messages_count(), 3);
        assert_eq!(forked.messages_count(), 4);
    }

    #[tokio::test]
    async fn stateless_node_streams_deltas_then_a_done_chunk() {
        let client = Arc::new(StreamingStubClient { deltas: vec!["hel", "lo"] });
        let node = StatelessLLMNode::new("l1", client, "test-model");
        let sink = Arc::new(crate::event::RecordingSink::new());
        let ctx = ExecutionContext::new("hi").with_sink(sink.clone());

        let chunks: Vec<OutputChunk> = node.execute_stream(ctx).collect().await;
        assert_eq!(chunks.len(), 3);
        match &chunks[0] {
            OutputChunk::Delta(text) => assert_eq!(text, "hel"),
            OutputChunk::Done(_) => panic!("expected a delta first"),
        }
        match &chunks[2] {
            OutputChunk::Done(result) => assert_eq!(result.attributes["content"], "hello"),
            OutputChunk::Delta(_) => panic!("expected a done chunk last"),
        }

        let events = sink.events();
        assert_eq!(events.iter().filter(|e| e.event_type == crate::event::EventType::OutputChunk).count(), 2);
        assert_eq!(events.iter().filter(|e| e.event_type == crate::event::EventType::OutputParsed).count(), 1);
    }

    #[tokio::test]
    async fn stateful_node_without_tools_streams_the_final_round() {
        let client = Arc::new(StreamingStubClient { deltas: vec!["ok"] });
        let node = StatefulLLMNode::new("a", client, "test-model");

        let chunks: Vec<OutputChunk> = node.execute_stream(ExecutionContext::new("hi")).collect().await;
        assert_eq!(chunks.len(), 2);
        match chunks.last().unwrap() {
            OutputChunk::Done(result) => assert_eq!(result.attributes["content"], "ok"),
            OutputChunk::Delta(_) => panic!("expected a done chunk last"),
        }
    }
}
