//! End-to-end command-dispatcher scenarios, driven the same way a connected client
//! would: build a `CommandEnvelope`, call `Dispatcher::dispatch`, inspect the
//! `CommandResponse`. No websocket in the loop — that framing is covered separately
//! in `nodeforge_server::transport`'s own unit tests.

use nodeforge_core::NullSink;
use nodeforge_server::{CommandEnvelope, Dispatcher, ProxyManager, ScriptRegistry, ServerConfig, SessionRegistry};
use serde_json::{json, Value};
use std::sync::Arc;

fn test_dispatcher() -> Dispatcher {
    let config = Arc::new(ServerConfig::default());
    let registry = Arc::new(SessionRegistry::new(config.history_config("default")));
    let proxies = Arc::new(ProxyManager::new(config.proxy.clone()));
    let scripts = Arc::new(ScriptRegistry::new());
    Dispatcher::new(registry, proxies, config, scripts, Arc::new(NullSink))
}

fn envelope(kind: &str, params: Value) -> CommandEnvelope {
    serde_json::from_value(json!({
        "type": kind,
        "params": params,
        "request_id": 1,
    }))
    .unwrap()
}

async fn dispatch_ok(dispatcher: &Dispatcher, kind: &str, params: Value) -> Value {
    let response = dispatcher.dispatch(envelope(kind, params)).await;
    assert!(response.success, "{kind} failed: {:?}", response.error);
    response.data.unwrap_or(Value::Null)
}

#[tokio::test]
async fn echo_round_trip_through_identity_node() {
    let dispatcher = test_dispatcher();

    dispatch_ok(&dispatcher, "create_node", json!({"id": "echo", "backend": "identity"})).await;

    let result = dispatch_ok(
        &dispatcher,
        "execute_input",
        json!({"node_id": "echo", "text": "hello"}),
    )
    .await;
    assert_eq!(result["response"]["output"], "hello");

    dispatch_ok(&dispatcher, "delete_node", json!({"node_id": "echo"})).await;

    let response = dispatcher
        .dispatch(envelope("execute_input", json!({"node_id": "echo", "text": "hi"})))
        .await;
    assert!(!response.success, "expected deleted node to be unreachable");
}

#[tokio::test]
async fn bash_node_reports_nonzero_exit_without_failing_the_command() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "sh", "backend": "bash"})).await;

    let result = dispatch_ok(
        &dispatcher,
        "execute_input",
        json!({"node_id": "sh", "text": "exit 7"}),
    )
    .await;
    assert_eq!(result["response"]["success"], false);
    assert_eq!(result["response"]["exit_code"], 7);
}

#[tokio::test]
async fn unknown_node_id_is_an_invalid_request() {
    let dispatcher = test_dispatcher();
    let response = dispatcher
        .dispatch(envelope("execute_input", json!({"node_id": "nope", "text": "x"})))
        .await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("nope"));
}

#[tokio::test]
async fn two_step_graph_chain_runs_in_dependency_order() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "a", "backend": "identity"})).await;
    dispatch_ok(&dispatcher, "create_node", json!({"id": "b", "backend": "identity"})).await;

    let result = dispatch_ok(
        &dispatcher,
        "execute_graph",
        json!({
            "steps": [
                {"id": "first", "node_id": "a", "input": "one"},
                {"id": "second", "node_id": "b", "depends_on": ["first"]},
            ],
        }),
    )
    .await;

    assert_eq!(result["success"], true);
    let order: Vec<String> = serde_json::from_value(result["execution_order"].clone()).unwrap();
    assert_eq!(order, vec!["first", "second"]);
}

#[tokio::test]
async fn run_graph_then_cancel_graph_interrupts_the_in_flight_step() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "a", "backend": "bash"})).await;
    dispatch_ok(
        &dispatcher,
        "create_graph",
        json!({"id": "g1", "steps": [{"id": "only", "node_id": "a", "input": "sleep 5"}]}),
    )
    .await;

    dispatch_ok(&dispatcher, "run_graph", json!({"graph_id": "g1"})).await;

    // A second concurrent run on the same stored graph is rejected while the first
    // is still in flight.
    let response = dispatcher.dispatch(envelope("run_graph", json!({"graph_id": "g1"}))).await;
    assert!(!response.success);

    dispatch_ok(&dispatcher, "cancel_graph", json!({"graph_id": "g1"})).await;
    // Cancelling is idempotent.
    dispatch_ok(&dispatcher, "cancel_graph", json!({"graph_id": "g1"})).await;

    let mut run = dispatch_ok(&dispatcher, "get_graph_run", json!({"graph_id": "g1"})).await;
    for _ in 0..50 {
        if run["state"] != "running" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        run = dispatch_ok(&dispatcher, "get_graph_run", json!({"graph_id": "g1"})).await;
    }
    assert_eq!(run["state"], "cancelled");
    assert_eq!(run["result"]["step_results"]["only"]["error_type"], "interrupted");

    // Once the run has landed, the slot is free again.
    dispatch_ok(&dispatcher, "run_graph", json!({"graph_id": "g1"})).await;
    dispatch_ok(&dispatcher, "cancel_graph", json!({"graph_id": "g1"})).await;
}

#[tokio::test]
async fn session_lifecycle_create_default_delete() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_session", json!({"name": "alt"})).await;

    let listed = dispatch_ok(&dispatcher, "list_sessions", json!({})).await;
    let names: Vec<String> = serde_json::from_value(listed["names"].clone()).unwrap();
    assert!(names.contains(&"alt".to_string()));

    dispatch_ok(&dispatcher, "set_default_session", json!({"name": "alt"})).await;
    let listed = dispatch_ok(&dispatcher, "list_sessions", json!({})).await;
    assert_eq!(listed["default"], "alt");

    // The registry refuses to remove whichever session is currently default.
    let response = dispatcher.dispatch(envelope("delete_session", json!({"name": "alt"}))).await;
    assert!(!response.success);
}

#[tokio::test]
async fn fork_node_produces_an_independently_addressable_node() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "src", "backend": "identity"})).await;

    let response = dispatcher
        .dispatch(envelope("fork_node", json!({"source_id": "src", "target_id": "forked"})))
        .await;
    // IdentityNode has no Forkable impl, so the default `try_fork` bridge surfaces
    // `not_implemented_error` rather than silently succeeding.
    assert!(!response.success);
}

#[tokio::test]
async fn ping_reports_live_session_and_node_counts() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "a", "backend": "identity"})).await;
    dispatch_ok(&dispatcher, "create_node", json!({"id": "b", "backend": "identity"})).await;

    let result = dispatch_ok(&dispatcher, "ping", json!({})).await;
    assert_eq!(result["pong"], true);
    assert_eq!(result["node_count"], 2);
}

#[tokio::test]
async fn stop_releases_every_session_node() {
    let dispatcher = test_dispatcher();
    dispatch_ok(&dispatcher, "create_node", json!({"id": "a", "backend": "bash"})).await;

    let result = dispatch_ok(&dispatcher, "stop", json!({})).await;
    assert_eq!(result["stopped"], true);
}

#[tokio::test]
async fn unknown_command_type_yields_invalid_request_not_a_panic() {
    let dispatcher = test_dispatcher();
    let response = dispatcher.dispatch(envelope("does_not_exist", json!({}))).await;
    assert!(!response.success);
}
