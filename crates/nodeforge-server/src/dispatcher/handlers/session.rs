//! Session handlers (§3.1, §6.2): create/delete/list/get sessions and reassign which
//! one resolves for `session_id: None`.

use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};

#[derive(Debug, Deserialize)]
pub struct CreateSessionParams {
    pub name: String,
}

pub async fn create_session(dispatcher: &Dispatcher, params: CreateSessionParams) -> Result<Value> {
    let history = dispatcher.config.history_config(&params.name);
    let session = dispatcher.registry.add_session(params.name.clone(), history)?;
    dispatcher
        .sink
        .emit(nodeforge_core::Event::new(nodeforge_core::EventType::SessionCreated).with_data("name", session.name().to_string()))
        .await;
    Ok(serde_json::json!({"name": session.name()}))
}

#[derive(Debug, Deserialize)]
pub struct SessionNameParams {
    pub name: String,
}

pub async fn delete_session(dispatcher: &Dispatcher, params: SessionNameParams) -> Result<Value> {
    let session = dispatcher.registry.remove_session(&params.name)?;
    session.stop_all_nodes().await;
    dispatcher
        .sink
        .emit(nodeforge_core::Event::new(nodeforge_core::EventType::SessionDeleted).with_data("name", params.name.clone()))
        .await;
    Ok(serde_json::json!({"deleted": true}))
}

pub async fn list_sessions(dispatcher: &Dispatcher) -> Result<Value> {
    Ok(serde_json::json!({
        "names": dispatcher.registry.list_session_names(),
        "default": dispatcher.registry.default_name(),
    }))
}

pub async fn get_session(dispatcher: &Dispatcher, params: SessionNameParams) -> Result<Value> {
    let session = dispatcher
        .registry
        .get_session(Some(&params.name))
        .map_err(|_| ServerError::SessionNotFound(params.name.clone()))?;
    Ok(serde_json::json!({
        "name": session.name(),
        "node_ids": session.list_node_ids(),
        "graph_ids": session.list_graph_ids(),
        "workflow_ids": session.list_workflow_ids(),
    }))
}

pub async fn set_default_session(dispatcher: &Dispatcher, params: SessionNameParams) -> Result<Value> {
    dispatcher.registry.set_default(&params.name)?;
    Ok(serde_json::json!({"default": params.name}))
}
