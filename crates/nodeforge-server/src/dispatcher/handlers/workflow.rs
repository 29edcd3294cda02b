//! Workflow handlers (§4.6, §6.2): start/list/inspect workflow runs and answer or
//! cancel a waiting gate.
//!
//! `execute_workflow` only runs workflows already registered in the session — this
//! package has no wire format for shipping an arbitrary callable, so registration
//! happens host-side (the same trust boundary the script-execution namespace draws,
//! §4.7) before a client can start a run.

use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::workflow::WorkflowRun;

#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub workflow_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub params: Value,
}

pub async fn execute_workflow(dispatcher: &Dispatcher, params: ExecuteWorkflowParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let workflow = session
        .get_workflow(&params.workflow_id)
        .ok_or_else(|| ServerError::WorkflowNotFound(params.workflow_id.clone()))?;
    let run = WorkflowRun::spawn(
        workflow,
        session.as_resolver(),
        dispatcher.sink.clone(),
        params.input,
        params.params,
    );
    let run_id = run.id.clone();
    session.add_run(run);
    Ok(serde_json::json!({"run_id": run_id}))
}

#[derive(Debug, Deserialize)]
pub struct SessionScopeParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn list_workflows(dispatcher: &Dispatcher, params: SessionScopeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    Ok(serde_json::json!({"workflow_ids": session.list_workflow_ids()}))
}

fn run_to_value(run: &WorkflowRun) -> Value {
    let (prompt, choices) = run.pending_gate_prompt().unzip();
    serde_json::json!({
        "run_id": run.id,
        "workflow_id": run.workflow_id,
        "state": run.state(),
        "result": run.result(),
        "error": run.error(),
        "pending_gate_prompt": prompt,
        "pending_gate_choices": choices.flatten(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RunIdParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub run_id: String,
}

pub async fn get_workflow_run(dispatcher: &Dispatcher, params: RunIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let run = session
        .get_run(&params.run_id)
        .ok_or_else(|| ServerError::RunNotFound(params.run_id.clone()))?;
    Ok(run_to_value(&run))
}

pub async fn list_workflow_runs(dispatcher: &Dispatcher, params: SessionScopeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let runs: Vec<Value> = session.list_runs().iter().map(|r| run_to_value(r)).collect();
    Ok(serde_json::json!({"runs": runs}))
}

#[derive(Debug, Deserialize)]
pub struct AnswerGateParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub run_id: String,
    pub answer: String,
}

pub async fn answer_gate(dispatcher: &Dispatcher, params: AnswerGateParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let run = session
        .get_run(&params.run_id)
        .ok_or_else(|| ServerError::RunNotFound(params.run_id.clone()))?;
    run.answer_gate(&params.answer)?;
    Ok(serde_json::json!({"answered": true}))
}

pub async fn cancel_workflow_run(dispatcher: &Dispatcher, params: RunIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let run = session
        .get_run(&params.run_id)
        .ok_or_else(|| ServerError::RunNotFound(params.run_id.clone()))?;
    run.cancel();
    Ok(serde_json::json!({"cancelled": true}))
}
