//! Event record and sink contract (§3.1 Event, §5 ordering guarantees).
//!
//! Events are one-way server→client records. Everything downstream of node/graph/
//! workflow execution pushes through an [`EventSink`] rather than returning events
//! directly, so the dispatcher (in `nodeforge-server`) can fan the same stream out to
//! every subscribing client without the core engine knowing about transports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeCreated,
    NodeDeleted,
    NodeReady,
    SessionCreated,
    SessionDeleted,
    ServerStopped,
    OutputChunk,
    OutputParsed,
    StepStarted,
    StepChunk,
    StepCompleted,
    StepFailed,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowNodeStarted,
    WorkflowNodeCompleted,
    GateWaiting,
    GateAnswered,
    /// A workflow-emitted event whose type name is caller-defined; the name travels in
    /// `data["custom_type"]` since `EventType` itself is a closed, wire-stable set.
    Custom,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            node_id: None,
            run_id: None,
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Destination for every event raised by a node, graph, or workflow run.
///
/// Implementations must be cheap to clone (an `Arc` around a broadcast sender, in the
/// server crate's case) since every execution path holds one.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// An `EventSink` that drops everything. Used as the default for ad-hoc node `execute`
/// calls that aren't part of a graph or workflow and have no subscriber to notify.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: Event) {}
}

/// Collects events in-memory; used by tests that assert on emission order.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_preserves_emission_order() {
        let sink = RecordingSink::new();
        sink.emit(Event::new(EventType::NodeCreated).with_node("a")).await;
        sink.emit(Event::new(EventType::NodeReady).with_node("a")).await;
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::NodeCreated);
        assert_eq!(events[1].event_type, EventType::NodeReady);
    }
}
