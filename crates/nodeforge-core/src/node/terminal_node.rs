//! PTYNode / ExternalTerminalNode / ClaudeTerminalNode (§3.1, §4.2, §4.4): persistent
//! nodes driving a terminal backend through a parser.
//!
//! All three share the same execute loop — write input, poll the backend until the
//! parser reports `is_ready`, parse the final buffer — implemented once in
//! [`TerminalCore`] and reused by each variant's thin [`Node`] impl.

use crate::error::{NodeError, Result};
use crate::event::{Event, EventType};
use crate::history::{HistoryConfig, HistoryOp, HistoryWriter};
use crate::parser::generic::GenericParser;
use crate::parser::Parser;
use crate::terminal::external::{ExternalTerminalBackend, PaneMultiplexer};
use crate::terminal::pty::{PtyBackend, PtySpawnConfig};
use crate::terminal::TerminalBackend;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{ExecutionContext, Forkable, Node, NodeInfo, NodeResult, NodeState};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared execute/interrupt/stop machinery for every terminal node variant.
struct TerminalCore {
    id: String,
    backend: Arc<dyn TerminalBackend>,
    parser: Arc<dyn Parser>,
    history: HistoryWriter,
    ready_timeout: Duration,
    state: Mutex<NodeState>,
    metadata: Mutex<Map<String, Value>>,
}

impl TerminalCore {
    async fn run(&self, id: &str, backend: &Arc<dyn TerminalBackend>) -> Result<()> {
        *self.state.lock() = NodeState::Starting;
        backend.wait_ready(self.ready_timeout).await?;
        *self.state.lock() = NodeState::Ready;
        self.history
            .record(HistoryOp::Lifecycle, serde_json::json!({"phase": "ready", "node_id": id}))
            .await;
        Ok(())
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        if *self.state.lock() != NodeState::Ready {
            return NodeResult::from_node_error(&NodeError::NodeStopped(self.id.clone()));
        }
        *self.state.lock() = NodeState::Busy;

        let parser: Arc<dyn Parser> = ctx.parser.clone().unwrap_or_else(|| self.parser.clone());
        let input = ctx.input.as_text();

        self.history
            .record(HistoryOp::Input, serde_json::json!({"text": input}))
            .await;

        let mut to_write = input.clone().into_bytes();
        to_write.push(b'\n');
        if let Err(e) = self.backend.write(&to_write).await {
            *self.state.lock() = NodeState::Error;
            return NodeResult::from_node_error(&e);
        }

        let deadline = ctx.timeout.map(|t| tokio::time::Instant::now() + t);
        let parsed = loop {
            let raw = match self.backend.read_all().await {
                Ok(raw) => raw,
                Err(e) => {
                    *self.state.lock() = NodeState::Error;
                    return NodeResult::from_node_error(&e);
                }
            };
            let parsed = parser.parse(&raw);
            if parsed.is_ready {
                break parsed;
            }
            ctx.sink
                .emit(
                    Event::new(EventType::OutputChunk)
                        .with_node(self.id.clone())
                        .with_data("raw", parsed.raw.clone()),
                )
                .await;
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    let _ = self.backend.signal_interrupt().await;
                    *self.state.lock() = NodeState::Ready;
                    return NodeResult::err("operation timed out", "timeout");
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        *self.state.lock() = NodeState::Ready;
        self.history
            .record(HistoryOp::Output, serde_json::json!({"raw": parsed.raw}))
            .await;
        ctx.sink
            .emit(
                Event::new(EventType::OutputParsed)
                    .with_node(self.id.clone())
                    .with_data("raw", parsed.raw.clone())
                    .with_data("is_complete", parsed.is_complete),
            )
            .await;

        let mut attributes = Map::new();
        attributes.insert("raw".to_string(), parsed.raw.into());
        attributes.insert("sections".to_string(), serde_json::to_value(&parsed.sections).unwrap_or(Value::Null));
        attributes.insert("is_ready".to_string(), parsed.is_ready.into());
        attributes.insert("is_complete".to_string(), parsed.is_complete.into());
        attributes.insert("tokens".to_string(), parsed.tokens.map(Value::from).unwrap_or(Value::Null));
        attributes.insert("parser".to_string(), parser.name().into());
        NodeResult::ok(attributes)
    }

    async fn interrupt(&self) {
        let _ = self.backend.signal_interrupt().await;
    }

    async fn stop(&self) -> Result<()> {
        *self.state.lock() = NodeState::Stopping;
        self.backend.stop().await?;
        *self.state.lock() = NodeState::Stopped;
        self.history
            .record(HistoryOp::Lifecycle, serde_json::json!({"phase": "stopped"}))
            .await;
        Ok(())
    }

    async fn to_info(&self, node_type: &'static str) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: node_type.to_string(),
            state: *self.state.lock(),
            metadata: self.metadata.lock().clone(),
        }
    }
}

pub struct PTYNode {
    core: TerminalCore,
}

impl PTYNode {
    /// Spawns the child process immediately; `start()` then waits for first output.
    pub fn spawn(
        id: impl Into<String>,
        config: PtySpawnConfig,
        parser: Option<Arc<dyn Parser>>,
        history_config: &HistoryConfig,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let id = id.into();
        let backend: Arc<dyn TerminalBackend> = Arc::new(PtyBackend::spawn(config)?);
        Ok(Self {
            core: TerminalCore {
                id: id.clone(),
                backend,
                parser: parser.unwrap_or_else(|| Arc::new(GenericParser)),
                history: HistoryWriter::new(history_config, id),
                ready_timeout,
                state: Mutex::new(NodeState::Created),
                metadata: Mutex::new(Map::new()),
            },
        })
    }
}

#[async_trait]
impl Node for PTYNode {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn node_type(&self) -> &'static str {
        "pty"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn state(&self) -> NodeState {
        *self.core.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        self.core.execute(ctx).await
    }

    async fn interrupt(&self) {
        self.core.interrupt().await
    }

    async fn start(&self) -> Result<()> {
        self.core.run(&self.core.id, &self.core.backend).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    async fn to_info(&self) -> NodeInfo {
        self.core.to_info(self.node_type()).await
    }
}

pub struct ExternalTerminalNode {
    core: TerminalCore,
    multiplexer: Arc<dyn PaneMultiplexer>,
    pane_id: String,
}

impl ExternalTerminalNode {
    /// Attaches to a pre-existing pane; spawning a new one first is the caller's job
    /// (via `multiplexer.spawn_pane`) when the pane doesn't exist yet.
    pub fn attach(
        id: impl Into<String>,
        multiplexer: Arc<dyn PaneMultiplexer>,
        pane_id: impl Into<String>,
        parser: Option<Arc<dyn Parser>>,
        history_config: &HistoryConfig,
        ready_timeout: Duration,
    ) -> Self {
        let id = id.into();
        let pane_id = pane_id.into();
        let backend: Arc<dyn TerminalBackend> =
            Arc::new(ExternalTerminalBackend::new(Box::new(PaneMultiplexerRef(multiplexer.clone())), pane_id.clone()));
        Self {
            core: TerminalCore {
                id: id.clone(),
                backend,
                parser: parser.unwrap_or_else(|| Arc::new(GenericParser)),
                history: HistoryWriter::new(history_config, id),
                ready_timeout,
                state: Mutex::new(NodeState::Created),
                metadata: Mutex::new(Map::new()),
            },
            multiplexer,
            pane_id,
        }
    }
}

/// Adapter letting an `Arc<dyn PaneMultiplexer>` satisfy the `Box<dyn PaneMultiplexer>`
/// constructor parameter `ExternalTerminalBackend::new` expects, without cloning the
/// underlying multiplexer connection.
struct PaneMultiplexerRef(Arc<dyn PaneMultiplexer>);

#[async_trait]
impl PaneMultiplexer for PaneMultiplexerRef {
    async fn send_keys(&self, pane_id: &str, bytes: &[u8]) -> Result<()> {
        self.0.send_keys(pane_id, bytes).await
    }
    async fn capture_pane(&self, pane_id: &str) -> Result<String> {
        self.0.capture_pane(pane_id).await
    }
    async fn send_signal(&self, pane_id: &str, signal: &str) -> Result<()> {
        self.0.send_signal(pane_id, signal).await
    }
    async fn pane_exists(&self, pane_id: &str) -> Result<bool> {
        self.0.pane_exists(pane_id).await
    }
    async fn spawn_pane(&self, pane_id: &str, command: &[String]) -> Result<()> {
        self.0.spawn_pane(pane_id, command).await
    }
}

#[async_trait]
impl Node for ExternalTerminalNode {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn node_type(&self) -> &'static str {
        "external_terminal"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn state(&self) -> NodeState {
        *self.core.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        self.core.execute(ctx).await
    }

    async fn interrupt(&self) {
        self.core.interrupt().await
    }

    async fn start(&self) -> Result<()> {
        self.core.run(&self.core.id, &self.core.backend).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    async fn to_info(&self) -> NodeInfo {
        self.core.to_info(self.node_type()).await
    }
}

/// Specialization of the external-terminal node tuned for a CLI that supports its own
/// resume/fork mechanism (§3.1, §4.4 "Claude terminal fork").
pub struct ClaudeTerminalNode {
    core: TerminalCore,
    multiplexer: Arc<dyn PaneMultiplexer>,
    pane_id: String,
    program: String,
    cli_session_id: Mutex<Option<String>>,
    history_config: HistoryConfig,
    ready_timeout: Duration,
}

impl ClaudeTerminalNode {
    pub fn attach(
        id: impl Into<String>,
        multiplexer: Arc<dyn PaneMultiplexer>,
        pane_id: impl Into<String>,
        program: impl Into<String>,
        cli_session_id: Option<String>,
        parser: Option<Arc<dyn Parser>>,
        history_config: HistoryConfig,
        ready_timeout: Duration,
    ) -> Self {
        let id = id.into();
        let pane_id = pane_id.into();
        let backend: Arc<dyn TerminalBackend> =
            Arc::new(ExternalTerminalBackend::new(Box::new(PaneMultiplexerRef(multiplexer.clone())), pane_id.clone()));
        let mut metadata = Map::new();
        if let Some(sid) = &cli_session_id {
            metadata.insert("cli_session_id".to_string(), sid.clone().into());
        }
        metadata.insert("pane_id".to_string(), pane_id.clone().into());
        Self {
            core: TerminalCore {
                id: id.clone(),
                backend,
                parser: parser.unwrap_or_else(|| Arc::new(GenericParser)),
                history: HistoryWriter::new(&history_config, id),
                ready_timeout,
                state: Mutex::new(NodeState::Created),
                metadata: Mutex::new(metadata),
            },
            multiplexer,
            pane_id,
            program: program.into(),
            cli_session_id: Mutex::new(cli_session_id),
            history_config,
            ready_timeout,
        }
    }

    pub fn cli_session_id(&self) -> Option<String> {
        self.cli_session_id.lock().clone()
    }
}

#[async_trait]
impl Node for ClaudeTerminalNode {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn node_type(&self) -> &'static str {
        "claude_terminal"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn state(&self) -> NodeState {
        *self.core.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        self.core.execute(ctx).await
    }

    async fn interrupt(&self) {
        self.core.interrupt().await
    }

    async fn start(&self) -> Result<()> {
        self.core.run(&self.core.id, &self.core.backend).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    async fn to_info(&self) -> NodeInfo {
        self.core.to_info(self.node_type()).await
    }
}

#[async_trait]
impl Forkable for ClaudeTerminalNode {
    /// Uses the CLI's own `--resume <id> --fork-session --session-id <new-id>`
    /// mechanism (§4.4). Fails with a validation error if the source node has no
    /// CLI-internal session id to resume from.
    async fn fork(&self, new_id: String) -> Result<Arc<dyn Node>> {
        let source_session_id = self.cli_session_id().ok_or_else(|| {
            NodeError::InvalidRequest(format!(
                "node {} has no cli_session_id to fork from",
                self.core.id
            ))
        })?;

        let new_pane_id = format!("{}-fork-{new_id}", self.pane_id);
        let command = vec![
            self.program.clone(),
            "--resume".to_string(),
            source_session_id,
            "--fork-session".to_string(),
            "--session-id".to_string(),
            new_id.clone(),
        ];
        self.multiplexer.spawn_pane(&new_pane_id, &command).await?;

        let forked = ClaudeTerminalNode::attach(
            new_id.clone(),
            self.multiplexer.clone(),
            new_pane_id,
            self.program.clone(),
            Some(new_id),
            None,
            self.history_config.clone(),
            self.ready_timeout,
        );
        forked.start().await?;
        Ok(Arc::new(forked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMultiplexer {
        panes: Mutex<HashMap<String, String>>,
    }

    impl FakeMultiplexer {
        fn new() -> Arc<dyn PaneMultiplexer> {
            Arc::new(Self {
                panes: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl PaneMultiplexer for FakeMultiplexer {
        async fn send_keys(&self, pane_id: &str, bytes: &[u8]) -> Result<()> {
            self.panes
                .lock()
                .entry(pane_id.to_string())
                .or_default()
                .push_str(&String::from_utf8_lossy(bytes));
            Ok(())
        }

        async fn capture_pane(&self, pane_id: &str) -> Result<String> {
            Ok(self.panes.lock().get(pane_id).cloned().unwrap_or_default())
        }

        async fn send_signal(&self, _pane_id: &str, _signal: &str) -> Result<()> {
            Ok(())
        }

        async fn pane_exists(&self, pane_id: &str) -> Result<bool> {
            Ok(self.panes.lock().contains_key(pane_id))
        }

        async fn spawn_pane(&self, pane_id: &str, _command: &[String]) -> Result<()> {
            self.panes.lock().insert(pane_id.to_string(), "> ".to_string());
            Ok(())
        }
    }

    fn history_config(dir: &std::path::Path) -> HistoryConfig {
        HistoryConfig {
            enabled: false,
            base_dir: dir.to_path_buf(),
            server_name: "srv".to_string(),
            session_name: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn execute_before_start_returns_node_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mux = FakeMultiplexer::new();
        mux.spawn_pane("p1", &[]).await.unwrap();
        let node = ExternalTerminalNode::attach(
            "t1",
            mux,
            "p1",
            None,
            &history_config(dir.path()),
            Duration::from_secs(1),
        );
        let result = node.execute(ExecutionContext::new("hi")).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("node_stopped"));
    }

    #[tokio::test]
    async fn execute_writes_input_and_returns_parsed_response() {
        let dir = tempfile::tempdir().unwrap();
        let mux = FakeMultiplexer::new();
        mux.spawn_pane("p1", &[]).await.unwrap();
        let node = ExternalTerminalNode::attach(
            "t1",
            mux,
            "p1",
            None,
            &history_config(dir.path()),
            Duration::from_secs(1),
        );
        node.start().await.unwrap();
        let result = node.execute(ExecutionContext::new("echo hi")).await;
        assert!(result.success);
        assert!(result.attributes["raw"].as_str().unwrap().contains("echo hi"));
        assert_eq!(result.attributes["parser"], "generic");
    }

    #[tokio::test]
    async fn fork_without_cli_session_id_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mux = FakeMultiplexer::new();
        mux.spawn_pane("p1", &[]).await.unwrap();
        let node = ClaudeTerminalNode::attach(
            "c1",
            mux,
            "p1",
            "claude",
            None,
            None,
            history_config(dir.path()),
            Duration::from_secs(1),
        );
        node.start().await.unwrap();
        let result = node.fork("c2".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fork_with_cli_session_id_spawns_resume_pane() {
        let dir = tempfile::tempdir().unwrap();
        let mux = FakeMultiplexer::new();
        mux.spawn_pane("p1", &[]).await.unwrap();
        let node = ClaudeTerminalNode::attach(
            "c1",
            mux,
            "p1",
            "claude",
            Some("cli-session-abc".to_string()),
            None,
            history_config(dir.path()),
            Duration::from_secs(1),
        );
        node.start().await.unwrap();
        let forked = node.fork("c2".to_string()).await.unwrap();
        assert_eq!(forked.id(), "c2");
    }
}
