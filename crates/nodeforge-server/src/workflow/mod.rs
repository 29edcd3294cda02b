//! Workflow runtime (§4.6): imperative coroutines with `run`/`gate`/`emit` and a
//! human-in-the-loop suspension point.
//!
//! A workflow wraps a single async callable over a [`WorkflowContext`]. Each
//! invocation spawns an independent [`WorkflowRun`] on its own logical task — the
//! callable is plain async Rust, so every `.await` inside it (a node call, a gate, an
//! I/O op upstream of nodeforge-core) is already a suspension point; cancellation rides
//! the same mechanism tokio gives any other task, via `tokio::select!` racing the
//! callable future against a cancellation notification.

use futures::future::BoxFuture;
use nodeforge_core::{Event, EventSink, EventType, ExecutionContext, NodeInput, NodeResult};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{info, warn};

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunState {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowRunState::Completed | WorkflowRunState::Failed | WorkflowRunState::Cancelled
        )
    }
}

pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// A registered workflow definition (§3.1 Workflow).
#[derive(Clone)]
pub struct Workflow {
    pub id: String,
    pub description: Option<String>,
    callable: WorkflowFn,
}

impl Workflow {
    pub fn new(id: impl Into<String>, callable: WorkflowFn) -> Self {
        Self { id: id.into(), description: None, callable }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The pending gate a run is suspended on: at most one at a time (§4.6 "exactly one
/// gate may be pending per run").
struct PendingGate {
    prompt: String,
    choices: Option<Vec<String>>,
    answer: oneshot::Sender<GateAnswer>,
}

enum GateAnswer {
    Value(String),
    Cancelled,
}

/// One execution of a [`Workflow`] (§3.1 WorkflowRun).
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    state: Mutex<WorkflowRunState>,
    started_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    finished_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    result: Mutex<Option<Value>>,
    error: Mutex<Option<String>>,
    pending_gate: Mutex<Option<PendingGate>>,
    state_map: Mutex<Map<String, Value>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl WorkflowRun {
    fn new(id: String, workflow_id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            workflow_id,
            state: Mutex::new(WorkflowRunState::Pending),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            result: Mutex::new(None),
            error: Mutex::new(None),
            pending_gate: Mutex::new(None),
            state_map: Mutex::new(Map::new()),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    pub fn state(&self) -> WorkflowRunState {
        *self.state.lock()
    }

    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn pending_gate_prompt(&self) -> Option<(String, Option<Vec<String>>)> {
        self.pending_gate
            .lock()
            .as_ref()
            .map(|g| (g.prompt.clone(), g.choices.clone()))
    }

    /// Spawns the workflow callable on its own task and returns immediately with a
    /// PENDING run that transitions to RUNNING before the caller can observe it.
    pub fn spawn(
        workflow: Arc<Workflow>,
        resolver: Arc<dyn nodeforge_core::NodeResolver>,
        sink: Arc<dyn EventSink>,
        input: Value,
        params: Value,
    ) -> Arc<WorkflowRun> {
        let run = WorkflowRun::new(uuid::Uuid::new_v4().to_string(), workflow.id.clone());
        *run.state.lock() = WorkflowRunState::Running;
        *run.started_at.lock() = Some(chrono::Utc::now());

        let ctx = WorkflowContext {
            run: run.clone(),
            resolver,
            sink: sink.clone(),
            input,
            params,
        };

        let task_run = run.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            sink.emit(Event::new(EventType::WorkflowStarted).with_run(run_id.clone())).await;
            let callable_fut = (workflow.callable)(ctx);
            tokio::select! {
                biased;
                _ = task_run.cancel_notify.notified() => {
                    task_run.finish(WorkflowRunState::Cancelled, None, Some("cancelled".to_string()));
                    sink.emit(Event::new(EventType::WorkflowCancelled).with_run(run_id.clone())).await;
                }
                outcome = callable_fut => {
                    match outcome {
                        Ok(value) => {
                            task_run.finish(WorkflowRunState::Completed, Some(value), None);
                            sink.emit(Event::new(EventType::WorkflowCompleted).with_run(run_id.clone())).await;
                        }
                        Err(e) => {
                            task_run.finish(WorkflowRunState::Failed, None, Some(e.clone()));
                            sink.emit(
                                Event::new(EventType::WorkflowFailed)
                                    .with_run(run_id.clone())
                                    .with_data("error", e),
                            )
                            .await;
                        }
                    }
                }
            }
        });

        run
    }

    fn finish(&self, state: WorkflowRunState, result: Option<Value>, error: Option<String>) {
        *self.state.lock() = state;
        *self.result.lock() = result;
        *self.error.lock() = error;
        *self.finished_at.lock() = Some(chrono::Utc::now());
    }

    /// Transitions RUNNING → WAITING, registers the pending gate, and suspends until
    /// `answer_gate` resolves it or the run is cancelled.
    async fn begin_gate(
        self: &Arc<Self>,
        prompt: String,
        choices: Option<Vec<String>>,
        timeout: Option<Duration>,
        sink: Arc<dyn EventSink>,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending_gate.lock();
            if guard.is_some() {
                return Err(ServerError::InvalidRequest(format!(
                    "run {} already has a pending gate",
                    self.id
                )));
            }
            *guard = Some(PendingGate { prompt: prompt.clone(), choices: choices.clone(), answer: tx });
            *self.state.lock() = WorkflowRunState::Waiting;
        }
        sink.emit(
            Event::new(EventType::GateWaiting)
                .with_run(self.id.clone())
                .with_data("prompt", prompt)
                .with_data("choices", serde_json::to_value(&choices).unwrap_or(Value::Null)),
        )
        .await;

        let wait = async {
            match timeout {
                Some(d) => tokio::time::timeout(d, rx).await.map_err(|_| ServerError::InvalidRequest(
                    "gate timed out waiting for an answer".to_string(),
                ))?,
                None => Ok(rx.await),
            }
        };

        let answer = match wait.await {
            Ok(Ok(GateAnswer::Value(v))) => v,
            Ok(Ok(GateAnswer::Cancelled)) | Err(_) => {
                return Err(ServerError::InvalidRequest("workflow run was cancelled while waiting on a gate".to_string()))
            }
            Ok(Err(_)) => {
                return Err(ServerError::Internal("gate channel dropped without an answer".to_string()))
            }
        };
        *self.state.lock() = WorkflowRunState::Running;
        Ok(answer)
    }

    /// Resolves the run's pending gate with `answer` (§6.2 `answer_gate`). Fails with
    /// `invalid_request_error` if the run isn't WAITING or the answer isn't a member of
    /// the configured choice set.
    pub fn answer_gate(&self, answer: &str) -> Result<()> {
        if self.state() != WorkflowRunState::Waiting {
            return Err(ServerError::InvalidRequest(format!(
                "run {} is not waiting on a gate",
                self.id
            )));
        }
        let mut guard = self.pending_gate.lock();
        let Some(gate) = guard.as_ref() else {
            return Err(ServerError::InvalidRequest(format!("run {} has no pending gate", self.id)));
        };
        if let Some(choices) = &gate.choices {
            if !choices.iter().any(|c| c == answer) {
                return Err(ServerError::InvalidRequest(format!(
                    "answer {answer:?} is not one of the gate's configured choices"
                )));
            }
        }
        let gate = guard.take().expect("checked Some above");
        let _ = gate.answer.send(GateAnswer::Value(answer.to_string()));
        Ok(())
    }

    /// Cancels the run: resolves any pending gate with a cancellation sentinel and
    /// notifies the spawned task to abandon the callable at its current suspension
    /// point (§4.6 "currently-suspended gates are resolved with cancellation").
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        if let Some(gate) = self.pending_gate.lock().take() {
            let _ = gate.answer.send(GateAnswer::Cancelled);
        }
        self.cancel_notify.notify_one();
    }
}

/// The argument a workflow callable receives: node execution, gates, custom events,
/// and a scratch state map, all scoped to this run (§4.6).
pub struct WorkflowContext {
    run: Arc<WorkflowRun>,
    resolver: Arc<dyn nodeforge_core::NodeResolver>,
    sink: Arc<dyn EventSink>,
    input: Value,
    params: Value,
}

impl WorkflowContext {
    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Looks up `node_id` in the owning session and executes it, emitting
    /// `node_started`/`node_completed` around the call.
    pub async fn run(
        &self,
        node_id: &str,
        input: impl Into<NodeInput>,
        timeout: Option<Duration>,
    ) -> Result<NodeResult> {
        let node = self.resolver.resolve(node_id).await.map_err(ServerError::Node)?;
        self.sink
            .emit(Event::new(EventType::WorkflowNodeStarted).with_run(self.run.id.clone()).with_node(node_id.to_string()))
            .await;

        let mut ctx = ExecutionContext::new(input).with_sink(self.sink.clone());
        if let Some(d) = timeout {
            ctx = ctx.with_timeout(d);
        }
        let result = node.execute(ctx).await;

        self.sink
            .emit(
                Event::new(EventType::WorkflowNodeCompleted)
                    .with_run(self.run.id.clone())
                    .with_node(node_id.to_string())
                    .with_data("success", result.success),
            )
            .await;
        Ok(result)
    }

    pub async fn gate(
        &self,
        prompt: impl Into<String>,
        choices: Option<Vec<String>>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let answer = self.run.begin_gate(prompt.into(), choices, timeout, self.sink.clone()).await?;
        self.sink
            .emit(
                Event::new(EventType::GateAnswered)
                    .with_run(self.run.id.clone())
                    .with_data("answer", answer.clone()),
            )
            .await;
        Ok(answer)
    }

    pub async fn emit(&self, event_type: impl Into<String>, data: Value) {
        self.sink
            .emit(
                Event::new(EventType::Custom)
                    .with_run(self.run.id.clone())
                    .with_data("custom_type", event_type.into())
                    .with_data("payload", data),
            )
            .await;
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut guard = self.run.state_map.lock();
        f(&mut guard)
    }
}

impl Drop for WorkflowRun {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            warn!(run_id = %self.id, "workflow run dropped without reaching a terminal state");
        } else {
            info!(run_id = %self.id, state = ?self.state(), "workflow run finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nodeforge_core::{Node, NodeError};
    use std::sync::atomic::AtomicUsize;

    struct EchoResolver;

    #[async_trait]
    impl nodeforge_core::NodeResolver for EchoResolver {
        async fn resolve(&self, node_id: &str) -> nodeforge_core::Result<Arc<dyn Node>> {
            if node_id == "echo" {
                Ok(Arc::new(nodeforge_core::node::identity::IdentityNode::new("echo")))
            } else {
                Err(NodeError::InvalidRequest(format!("no such node {node_id}")))
            }
        }
    }

    fn sink() -> Arc<nodeforge_core::RecordingSink> {
        Arc::new(nodeforge_core::RecordingSink::new())
    }

    #[tokio::test]
    async fn gated_workflow_completes_after_answer() {
        let workflow = Arc::new(Workflow::new(
            "gated",
            Arc::new(|ctx: WorkflowContext| {
                Box::pin(async move {
                    let echoed = ctx.run("echo", "hi", None).await.map_err(|e| e.to_string())?;
                    let answer = ctx.gate("ok?", Some(vec!["y".into(), "n".into()]), None).await.map_err(|e| e.to_string())?;
                    Ok(serde_json::json!({"echoed": echoed.success, "answer": answer}))
                }) as BoxFuture<'static, std::result::Result<Value, String>>
            }),
        ));

        let run = WorkflowRun::spawn(workflow, Arc::new(EchoResolver), sink(), Value::Null, Value::Null);
        // Give the task a chance to reach the gate.
        for _ in 0..50 {
            if run.state() == WorkflowRunState::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(run.state(), WorkflowRunState::Waiting);

        run.answer_gate("y").unwrap();
        for _ in 0..50 {
            if run.state().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(run.state(), WorkflowRunState::Completed);
        assert_eq!(run.result().unwrap()["answer"], "y");
    }

    #[test]
    fn answer_gate_rejects_answer_outside_choice_set() {
        let run = WorkflowRun::new("r1".to_string(), "wf".to_string());
        *run.state.lock() = WorkflowRunState::Waiting;
        let (tx, _rx) = oneshot::channel();
        *run.pending_gate.lock() = Some(PendingGate {
            prompt: "ok?".to_string(),
            choices: Some(vec!["y".to_string(), "n".to_string()]),
            answer: tx,
        });
        assert!(run.answer_gate("maybe").is_err());
        assert_eq!(run.state(), WorkflowRunState::Waiting);
    }

    #[tokio::test]
    async fn cancel_resolves_pending_gate_with_cancellation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let workflow = Arc::new(Workflow::new(
            "cancellable",
            Arc::new(move |ctx: WorkflowContext| {
                let counter = counter2.clone();
                Box::pin(async move {
                    let result = ctx.gate("wait forever", None, None).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    result.map(|_| Value::Null).map_err(|e| e.to_string())
                }) as BoxFuture<'static, std::result::Result<Value, String>>
            }),
        ));
        let run = WorkflowRun::spawn(workflow, Arc::new(EchoResolver), sink(), Value::Null, Value::Null);
        for _ in 0..50 {
            if run.state() == WorkflowRunState::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        run.cancel();
        for _ in 0..50 {
            if run.state().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(run.state(), WorkflowRunState::Cancelled);
    }
}
