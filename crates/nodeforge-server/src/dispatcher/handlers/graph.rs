//! Graph handlers (§4.5, §6.2): create/delete/list/get manage a stored graph; execute
//! runs an ad-hoc set of steps inline; run/cancel start and stop a stored graph's
//! execution in the background.

use nodeforge_core::{ErrorPolicy, Graph, NodeInput, StepInput, StepSpec};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::graph_run::GraphRun;

#[derive(Debug, Deserialize)]
pub struct StepParams {
    pub id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub error_policy: Option<StepErrorPolicyParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorPolicyParam {
    FailFast,
    Continue,
    SkipDownstream,
    Retry { attempts: usize },
}

impl From<StepErrorPolicyParam> for ErrorPolicy {
    fn from(p: StepErrorPolicyParam) -> Self {
        match p {
            StepErrorPolicyParam::FailFast => ErrorPolicy::FailFast,
            StepErrorPolicyParam::Continue => ErrorPolicy::Continue,
            StepErrorPolicyParam::SkipDownstream => ErrorPolicy::SkipDownstream,
            StepErrorPolicyParam::Retry { attempts } => ErrorPolicy::Retry(attempts),
        }
    }
}

fn build_step(spec: StepParams) -> Result<StepSpec> {
    let node_id = spec
        .node_id
        .ok_or_else(|| ServerError::InvalidRequest(format!("step {} has no node_id", spec.id)))?;
    let mut step = StepSpec::by_id(spec.id, node_id).depends_on(spec.depends_on);
    if let Some(input) = spec.input {
        step = step.with_static_input(NodeInput::Structured(input));
    } else if !step.depends_on.is_empty() {
        step = step.with_input(StepInput::Inherited);
    }
    if let Some(policy) = spec.error_policy {
        step = step.with_error_policy(policy.into());
    }
    Ok(step)
}

fn build_graph(id: impl Into<String>, steps: Vec<StepParams>, max_parallel: Option<usize>) -> Result<Graph> {
    let mut graph = Graph::new(id);
    if let Some(max_parallel) = max_parallel {
        graph = graph.with_max_parallel(max_parallel);
    }
    for spec in steps {
        graph.add_step(build_step(spec)?).map_err(ServerError::Node)?;
    }
    graph.validate().map_err(ServerError::Node)?;
    Ok(graph)
}

#[derive(Debug, Deserialize)]
pub struct CreateGraphParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub id: String,
    pub steps: Vec<StepParams>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

pub async fn create_graph(dispatcher: &Dispatcher, params: CreateGraphParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let graph = build_graph(params.id.clone(), params.steps, params.max_parallel)?;
    session.add_graph(params.id.clone(), Arc::new(graph)).map_err(ServerError::Node)?;
    Ok(serde_json::json!({"graph_id": params.id}))
}

#[derive(Debug, Deserialize)]
pub struct GraphIdParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub graph_id: String,
}

pub async fn delete_graph(dispatcher: &Dispatcher, params: GraphIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    session
        .remove_graph(&params.graph_id)
        .ok_or_else(|| ServerError::GraphNotFound(params.graph_id.clone()))?;
    dispatcher.graph_runs.lock().remove(&params.graph_id);
    Ok(serde_json::json!({"deleted": true}))
}

#[derive(Debug, Deserialize)]
pub struct SessionScopeParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn list_graphs(dispatcher: &Dispatcher, params: SessionScopeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    Ok(serde_json::json!({"graph_ids": session.list_graph_ids()}))
}

pub async fn get_graph(dispatcher: &Dispatcher, params: GraphIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let graph = session
        .get_graph(&params.graph_id)
        .ok_or_else(|| ServerError::GraphNotFound(params.graph_id.clone()))?;
    Ok(serde_json::json!({"graph_id": graph.id()}))
}

pub async fn validate_graph(dispatcher: &Dispatcher, params: GraphIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let graph = session
        .get_graph(&params.graph_id)
        .ok_or_else(|| ServerError::GraphNotFound(params.graph_id.clone()))?;
    match graph.validate() {
        Ok(()) => Ok(serde_json::json!({"valid": true})),
        Err(e) => Ok(serde_json::json!({"valid": false, "error": e.to_string()})),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteGraphParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    pub steps: Vec<StepParams>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// `execute_graph` (§6.2, §4.5): an ad-hoc set of steps, built and run inline,
/// returning `{step_results, execution_order, duration_ms, success}` once every step
/// reaches a terminal state. Not stored in the session — nothing to `cancel_graph` by
/// id afterward.
pub async fn execute_graph(dispatcher: &Dispatcher, params: ExecuteGraphParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let graph_id = params.id.unwrap_or_else(|| format!("adhoc-{}", uuid::Uuid::new_v4()));
    let graph = build_graph(graph_id, params.steps, params.max_parallel)?;
    let input = params.input.map(NodeInput::Structured).unwrap_or(NodeInput::Text(String::new()));
    let resolver = session.as_resolver();
    let result = graph.execute(&*resolver, input, dispatcher.sink.clone()).await;
    Ok(serde_json::json!({
        "success": result.success,
        "step_results": result.step_results,
        "execution_order": result.execution_order,
        "duration_ms": result.duration_ms,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RunGraphParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub graph_id: String,
    #[serde(default)]
    pub input: Option<Value>,
}

/// `run_graph`: executes a previously-`create_graph`d graph on its own task, tracked
/// by `graph_id` so `cancel_graph` can stop it and `get_graph_run` can retrieve its
/// `step_results`/`success`/`duration_ms` once it lands. Returns immediately;
/// progress is also observable live through the session's event stream
/// (`step_started`/`step_completed`/...).
pub async fn run_graph(dispatcher: &Dispatcher, params: RunGraphParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let graph = session
        .get_graph(&params.graph_id)
        .ok_or_else(|| ServerError::GraphNotFound(params.graph_id.clone()))?;
    {
        let mut runs = dispatcher.graph_runs.lock();
        if let Some(existing) = runs.get(&params.graph_id) {
            if !existing.state().is_terminal() {
                return Err(ServerError::InvalidRequest(format!(
                    "graph {} already has a run in flight",
                    params.graph_id
                )));
            }
        }
        runs.remove(&params.graph_id);
    }

    let input = params.input.map(NodeInput::Structured).unwrap_or(NodeInput::Text(String::new()));
    let resolver = session.as_resolver();
    let sink = dispatcher.sink.clone();
    let graph_id = params.graph_id.clone();

    let run = GraphRun::spawn(graph_id.clone(), graph, resolver, sink, input);
    dispatcher.graph_runs.lock().insert(graph_id, run);
    Ok(serde_json::json!({"started": true, "graph_id": params.graph_id}))
}

/// Polls a `run_graph` task's progress or terminal result (§6.2). `result` stays
/// `null` until the run reaches a terminal state.
pub async fn get_graph_run(dispatcher: &Dispatcher, params: GraphIdParams) -> Result<Value> {
    let run = dispatcher
        .graph_runs
        .lock()
        .get(&params.graph_id)
        .cloned()
        .ok_or_else(|| ServerError::GraphNotFound(params.graph_id.clone()))?;
    let result = run.result().map(|r| {
        serde_json::json!({
            "success": r.success,
            "step_results": r.step_results,
            "execution_order": r.execution_order,
            "duration_ms": r.duration_ms,
        })
    });
    Ok(serde_json::json!({
        "graph_id": run.graph_id,
        "state": run.state(),
        "result": result,
    }))
}

pub async fn cancel_graph(dispatcher: &Dispatcher, params: GraphIdParams) -> Result<Value> {
    let run = dispatcher.graph_runs.lock().get(&params.graph_id).cloned();
    if let Some(run) = run {
        run.cancel();
    }
    Ok(serde_json::json!({"cancelled": true}))
}
