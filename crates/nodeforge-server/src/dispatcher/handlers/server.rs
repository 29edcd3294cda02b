//! Server meta-commands (§6.2): `ping` for a liveness/inventory check, `stop` for an
//! orderly shutdown signal.

use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::Result;

pub async fn ping(dispatcher: &Dispatcher) -> Result<Value> {
    let sessions = dispatcher.registry.get_all_sessions();
    let node_count: usize = sessions.iter().map(|s| s.list_node_ids().len()).sum();
    Ok(serde_json::json!({
        "pong": true,
        "session_count": sessions.len(),
        "node_count": node_count,
    }))
}

/// `stop` (§6.2): releases every session's persistent nodes and every active proxy.
/// Actually tearing down the transport (closing listener sockets, ending the process)
/// is the binary entrypoint's job once this returns — the dispatcher itself has no
/// notion of the process lifecycle.
pub async fn stop(dispatcher: &Dispatcher) -> Result<Value> {
    for session in dispatcher.registry.get_all_sessions() {
        session.stop_all_nodes().await;
    }
    dispatcher.proxies.shutdown_all().await;
    dispatcher
        .sink
        .emit(nodeforge_core::Event::new(nodeforge_core::EventType::ServerStopped))
        .await;
    Ok(serde_json::json!({"stopped": true}))
}
