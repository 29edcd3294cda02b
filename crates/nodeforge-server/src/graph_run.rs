//! Background graph runs (§4.5, §6.2): `run_graph` spawns a stored graph's execution
//! on its own task and keeps the result around so `cancel_graph` has something
//! cooperative to stop and a caller can retrieve `step_results`/`success`/
//! `duration_ms` once the run lands, instead of both being thrown away the moment
//! the task finishes.

use nodeforge_core::{CancelToken, EventSink, Graph, GraphResult, NodeInput, NodeResolver};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphRunState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GraphRunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GraphRunState::Running)
    }
}

/// One background execution of a stored graph, tracked by `graph_id` (§4.5 "run
/// (stored graph), cancel"). At most one per graph id at a time — `run_graph`
/// refuses to start a second while this one is still `Running`.
pub struct GraphRun {
    pub graph_id: String,
    state: Mutex<GraphRunState>,
    result: Mutex<Option<GraphResult>>,
    cancel: CancelToken,
}

impl GraphRun {
    pub fn state(&self) -> GraphRunState {
        *self.state.lock()
    }

    pub fn result(&self) -> Option<GraphResult> {
        self.result.lock().clone()
    }

    /// Spawns `graph.execute_cancellable` on its own task and returns immediately
    /// with a RUNNING run. The task interrupts in-flight steps and records
    /// `interrupted`/`cancelled` results for the rest if `cancel()` is called
    /// before the graph finishes on its own.
    pub fn spawn(
        graph_id: String,
        graph: Arc<Graph>,
        resolver: Arc<dyn NodeResolver>,
        sink: Arc<dyn EventSink>,
        input: NodeInput,
    ) -> Arc<GraphRun> {
        let cancel = CancelToken::new();
        let run = Arc::new(GraphRun {
            graph_id,
            state: Mutex::new(GraphRunState::Running),
            result: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let task_run = run.clone();
        tokio::spawn(async move {
            let result = graph.execute_cancellable(&*resolver, input, sink, &cancel).await;
            let state = if cancel.is_cancelled() {
                GraphRunState::Cancelled
            } else if result.success {
                GraphRunState::Completed
            } else {
                GraphRunState::Failed
            };
            *task_run.state.lock() = state;
            *task_run.result.lock() = Some(result);
        });

        run
    }

    /// Requests cancellation (§6.2 `cancel_graph`). A no-op once the run has
    /// already reached a terminal state.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
    }
}
