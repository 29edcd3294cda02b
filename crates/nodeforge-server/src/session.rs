//! Session (§3.1): owns nodes, graphs, workflows, and workflow runs under one shared
//! id namespace, plus this session's history-logging configuration.
//!
//! A session doubles as the [`NodeResolver`] a graph or workflow needs to turn a
//! node-id reference into a live node — nodes and nested graphs (a `Graph` implements
//! `Node`, §9) share the lookup. `Session` is always held behind an `Arc`, constructed
//! with `Arc::new_cyclic` so it can hand a weak reference to itself to any graph it
//! resolves, matching `Graph::set_resolver`'s expectation.

use async_trait::async_trait;
use nodeforge_core::{Graph, HistoryConfig, Node, NodeError, NodeInfo, NodeResolver, Result as CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::workflow::{Workflow, WorkflowRun};

/// One of the three id-namespaced entities a session owns, named so `id_exists`
/// callers can report exactly what collided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Graph,
    Workflow,
}

pub struct Session {
    name: String,
    history: HistoryConfig,
    nodes: RwLock<HashMap<String, Arc<dyn Node>>>,
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    runs: RwLock<HashMap<String, Arc<WorkflowRun>>>,
    self_ref: Weak<Session>,
}

impl Session {
    pub fn new(name: impl Into<String>, history: HistoryConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            history,
            nodes: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history_config(&self) -> &HistoryConfig {
        &self.history
    }

    /// The one namespace nodes, graphs, and workflows all share (§3.1).
    pub fn id_exists(&self, id: &str) -> Option<EntityKind> {
        if self.nodes.read().contains_key(id) {
            Some(EntityKind::Node)
        } else if self.graphs.read().contains_key(id) {
            Some(EntityKind::Graph)
        } else if self.workflows.read().contains_key(id) {
            Some(EntityKind::Workflow)
        } else {
            None
        }
    }

    fn check_id_free(&self, id: &str) -> CoreResult<()> {
        if let Some(kind) = self.id_exists(id) {
            return Err(NodeError::InvalidRequest(format!(
                "id {id:?} already in use by a {kind:?} in session {:?}",
                self.name
            )));
        }
        Ok(())
    }

    // --- nodes -----------------------------------------------------------------

    pub fn add_node(&self, id: String, node: Arc<dyn Node>) -> CoreResult<()> {
        self.check_id_free(&id)?;
        self.nodes.write().insert(id, node);
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.read().get(id).cloned()
    }

    pub fn remove_node(&self, id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.write().remove(id)
    }

    pub fn list_node_ids(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    pub async fn list_node_infos(&self) -> Vec<NodeInfo> {
        let nodes: Vec<Arc<dyn Node>> = self.nodes.read().values().cloned().collect();
        let mut infos = Vec::with_capacity(nodes.len());
        for node in nodes {
            infos.push(node.to_info().await);
        }
        infos
    }

    // --- graphs ------------------------------------------------------------------

    pub fn add_graph(&self, id: String, graph: Arc<Graph>) -> CoreResult<()> {
        self.check_id_free(&id)?;
        graph.set_resolver(self.as_resolver());
        self.graphs.write().insert(id, graph);
        Ok(())
    }

    pub fn get_graph(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.read().get(id).cloned()
    }

    pub fn remove_graph(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.write().remove(id)
    }

    pub fn list_graph_ids(&self) -> Vec<String> {
        self.graphs.read().keys().cloned().collect()
    }

    // --- workflows & runs ---------------------------------------------------------

    pub fn add_workflow(&self, workflow: Arc<Workflow>) -> CoreResult<()> {
        self.check_id_free(&workflow.id)?;
        self.workflows.write().insert(workflow.id.clone(), workflow);
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().get(id).cloned()
    }

    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    pub fn add_run(&self, run: Arc<WorkflowRun>) {
        self.runs.write().insert(run.id.clone(), run);
    }

    pub fn get_run(&self, id: &str) -> Option<Arc<WorkflowRun>> {
        self.runs.read().get(id).cloned()
    }

    pub fn list_runs(&self) -> Vec<Arc<WorkflowRun>> {
        self.runs.read().values().cloned().collect()
    }

    /// A resolver bound to this session, usable by a graph's own steps or by a
    /// workflow context's `run(node_id, ...)`.
    pub fn as_resolver(&self) -> Arc<dyn NodeResolver> {
        self.self_ref.upgrade().expect("session resolving its own Arc while alive")
    }

    /// Stops every persistent node this session owns (§3.1 "destroyed ... all
    /// persistent children are stopped"). Proxy release is the caller's
    /// responsibility (the proxy manager, not the session, owns port lifetime).
    pub async fn stop_all_nodes(&self) {
        let nodes: Vec<Arc<dyn Node>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            if node.is_persistent() {
                let _ = node.stop().await;
            }
        }
    }
}

#[async_trait]
impl NodeResolver for Session {
    async fn resolve(&self, node_id: &str) -> CoreResult<Arc<dyn Node>> {
        if let Some(node) = self.get_node(node_id) {
            return Ok(node);
        }
        if let Some(graph) = self.get_graph(node_id) {
            return Ok(graph as Arc<dyn Node>);
        }
        Err(NodeError::InvalidRequest(format!(
            "no node or graph named {node_id:?} in session {:?}",
            self.name
        )))
    }
}
