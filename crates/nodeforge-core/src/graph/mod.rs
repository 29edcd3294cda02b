//! Graph: a DAG of steps over nodes (§3.1, §4.5).
//!
//! A graph doesn't own the nodes it schedules — steps reference them either directly
//! (`NodeRef::Direct`) or by id, resolved lazily against whatever [`NodeResolver`] the
//! caller supplies at `execute` time (in practice, a session). This mirrors §9's note
//! that cyclic/owning references should collapse to id-based lookups wherever
//! possible; direct pointers remain for ad-hoc, not-yet-registered nodes.

pub mod schedule;

use crate::error::{NodeError, Result};
use crate::event::EventSink;
use crate::node::{ExecutionContext, Node, NodeInfo, NodeInput, NodeResult, NodeState};
use crate::parser::Parser;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Resolves a node-id reference against whatever owns the node namespace (§3.1
/// Session owns nodes; the graph itself does not).
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve(&self, node_id: &str) -> Result<Arc<dyn Node>>;
}

#[derive(Clone)]
pub enum NodeRef {
    Direct(Arc<dyn Node>),
    Id(String),
}

pub type InputFn = Arc<dyn Fn(&HashMap<String, NodeResult>) -> NodeInput + Send + Sync>;

#[derive(Clone)]
pub enum StepInput {
    Static(NodeInput),
    Dynamic(InputFn),
    /// No input configured; falls back to the graph-level execution input (§4.5.3)
    /// only when the step has no dependencies.
    Inherited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    FailFast,
    Continue,
    SkipDownstream,
    Retry(usize),
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::FailFast
    }
}

#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub node_ref: NodeRef,
    pub input: StepInput,
    pub depends_on: Vec<String>,
    pub error_policy: ErrorPolicy,
    pub parser_override: Option<Arc<dyn Parser>>,
}

/// Raw step construction parameters, as a command-dispatcher or test would supply
/// them — `node` and `node_id` are both optional so the "both set" ambiguity the
/// source tolerated (§9 Open Questions) can be validated explicitly rather than
/// silently preferring one.
pub struct StepSpec {
    pub id: String,
    pub node: Option<Arc<dyn Node>>,
    pub node_id: Option<String>,
    pub input: StepInput,
    pub depends_on: Vec<String>,
    pub error_policy: ErrorPolicy,
    pub parser_override: Option<Arc<dyn Parser>>,
}

impl StepSpec {
    pub fn direct(id: impl Into<String>, node: Arc<dyn Node>) -> Self {
        Self {
            id: id.into(),
            node: Some(node),
            node_id: None,
            input: StepInput::Inherited,
            depends_on: Vec::new(),
            error_policy: ErrorPolicy::default(),
            parser_override: None,
        }
    }

    pub fn by_id(id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node: None,
            node_id: Some(node_id.into()),
            input: StepInput::Inherited,
            depends_on: Vec::new(),
            error_policy: ErrorPolicy::default(),
            parser_override: None,
        }
    }

    pub fn with_input(mut self, input: StepInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_static_input(mut self, input: impl Into<NodeInput>) -> Self {
        self.input = StepInput::Static(input.into());
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.depends_on = ids.into_iter().collect();
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    fn into_step(self) -> Result<Step> {
        let node_ref = match (self.node, self.node_id) {
            (Some(_), Some(_)) => {
                return Err(NodeError::InvalidRequest(format!(
                    "step {} sets both a direct node and a node_id reference",
                    self.id
                )))
            }
            (Some(node), None) => NodeRef::Direct(node),
            (None, Some(id)) => NodeRef::Id(id),
            (None, None) => {
                return Err(NodeError::InvalidRequest(format!(
                    "step {} has neither a direct node nor a node_id reference",
                    self.id
                )))
            }
        };
        Ok(Step {
            id: self.id,
            node_ref,
            input: self.input,
            depends_on: self.depends_on,
            error_policy: self.error_policy,
            parser_override: self.parser_override,
        })
    }
}

/// Cooperative cancellation signal for a running graph (§4.5 cancel). Cheap to
/// clone and share between the task driving [`Graph::execute_cancellable`] and
/// whatever wants to stop it early; a plain `Arc<AtomicBool>` wouldn't wake a
/// scheduler loop parked on `JoinSet::join_next`, so this pairs the flag with a
/// `Notify` the scheduler selects against.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
        self.0.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` has been called. Safe to call repeatedly from a loop:
    /// if the flag is already set this returns immediately instead of waiting for a
    /// fresh notification.
    pub(crate) async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct GraphResult {
    pub success: bool,
    pub step_results: HashMap<String, NodeResult>,
    pub execution_order: Vec<String>,
    pub duration_ms: u64,
}

pub struct Graph {
    id: String,
    steps: HashMap<String, Step>,
    max_parallel: usize,
    resolver: Mutex<Option<Arc<dyn NodeResolver>>>,
    state: Mutex<NodeState>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: HashMap::new(),
            max_parallel: 1,
            resolver: Mutex::new(None),
            state: Mutex::new(NodeState::Ready),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_step(&mut self, spec: StepSpec) -> Result<()> {
        let step = spec.into_step()?;
        if self.steps.contains_key(&step.id) {
            return Err(NodeError::InvalidRequest(format!(
                "duplicate step id {} in graph {}",
                step.id, self.id
            )));
        }
        self.steps.insert(step.id.clone(), step);
        Ok(())
    }

    /// Bind the resolver a nested-graph step will use when this graph itself is
    /// executed through the `Node` contract (§9 "a graph implements the node
    /// contract and may be a step").
    pub fn set_resolver(&self, resolver: Arc<dyn NodeResolver>) {
        *self.resolver.lock() = Some(resolver);
    }

    /// Validation pass (§4.5.1): step-ids unique (enforced at insertion), every
    /// `depends_on` target exists, and the dependency graph has no cycles.
    pub fn validate(&self) -> Result<()> {
        for step in self.steps.values() {
            for dep in &step.depends_on {
                if !self.steps.contains_key(dep) {
                    return Err(NodeError::InvalidRequest(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks: HashMap<&str, Mark> =
            self.steps.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();

        fn visit<'a>(
            id: &'a str,
            steps: &'a HashMap<String, Step>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(id).copied() {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(NodeError::InvalidRequest(format!("cycle detected at step {id}")))
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            if let Some(step) = steps.get(id) {
                for dep in &step.depends_on {
                    visit(dep, steps, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in self.steps.keys() {
            visit(id, &self.steps, &mut marks)?;
        }
        Ok(())
    }

    pub async fn execute(
        &self,
        resolver: &dyn NodeResolver,
        input: NodeInput,
        sink: Arc<dyn EventSink>,
    ) -> GraphResult {
        self.execute_cancellable(resolver, input, sink, &CancelToken::new()).await
    }

    /// Same as [`Graph::execute`] but lets a caller stop the run early through
    /// `cancel` (§4.5 `cancel_graph`): in-flight steps are `interrupt()`ed and
    /// recorded as `interrupted`, still-pending ones as `cancelled`.
    pub async fn execute_cancellable(
        &self,
        resolver: &dyn NodeResolver,
        input: NodeInput,
        sink: Arc<dyn EventSink>,
        cancel: &CancelToken,
    ) -> GraphResult {
        self::schedule::run(self, resolver, input, sink, cancel).await
    }

    pub(crate) fn steps(&self) -> &HashMap<String, Step> {
        &self.steps
    }

    pub(crate) fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

#[async_trait]
impl Node for Graph {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "graph"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn state(&self) -> NodeState {
        *self.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        if let Err(e) = self.validate() {
            return NodeResult::from_node_error(&e);
        }
        let resolver = self.resolver.lock().clone();
        let Some(resolver) = resolver else {
            return NodeResult::from_node_error(&NodeError::Internal(format!(
                "graph {} executed as a node without a bound resolver",
                self.id
            )));
        };
        *self.state.lock() = NodeState::Busy;
        let result = self::schedule::run(self, &*resolver, ctx.input, ctx.sink).await;
        *self.state.lock() = NodeState::Ready;

        let mut attributes = serde_json::Map::new();
        attributes.insert("success".to_string(), result.success.into());
        attributes.insert(
            "step_results".to_string(),
            serde_json::to_value(&result.step_results).unwrap_or(serde_json::Value::Null),
        );
        attributes.insert("execution_order".to_string(), result.execution_order.into());
        attributes.insert("duration_ms".to_string(), result.duration_ms.into());
        NodeResult {
            success: result.success,
            error: None,
            error_type: None,
            attributes,
        }
    }

    async fn interrupt(&self) {
        for step in self.steps.values() {
            if let NodeRef::Direct(node) = &step.node_ref {
                node.interrupt().await;
            }
        }
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: *self.state.lock(),
            metadata: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_unknown_dependency() {
        let mut graph = Graph::new("g1");
        graph
            .add_step(StepSpec::by_id("a", "node-a").depends_on(["missing".to_string()]))
            .unwrap();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn validate_rejects_cycles() {
        let mut graph = Graph::new("g1");
        graph
            .add_step(StepSpec::by_id("a", "node-a").depends_on(["b".to_string()]))
            .unwrap();
        graph
            .add_step(StepSpec::by_id("b", "node-b").depends_on(["a".to_string()]))
            .unwrap();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn add_step_rejects_both_direct_and_id_reference() {
        use crate::node::identity::IdentityNode;
        let mut graph = Graph::new("g1");
        let mut spec = StepSpec::direct("a", Arc::new(IdentityNode::new("x")));
        spec.node_id = Some("also-by-id".to_string());
        assert!(graph.add_step(spec).is_err());
    }

    #[tokio::test]
    async fn validate_accepts_simple_chain() {
        let mut graph = Graph::new("g1");
        graph.add_step(StepSpec::by_id("a", "node-a")).unwrap();
        graph
            .add_step(StepSpec::by_id("b", "node-b").depends_on(["a".to_string()]))
            .unwrap();
        assert!(graph.validate().is_ok());
    }
}
