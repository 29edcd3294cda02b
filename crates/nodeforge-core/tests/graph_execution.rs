//! Graph-engine properties not already covered by `graph::schedule`'s own unit tests:
//! `SkipDownstream` propagation and `max_parallel` bounding concurrent step starts.

use async_trait::async_trait;
use nodeforge_core::node::function::FunctionNode;
use nodeforge_core::{
    ErrorPolicy, ExecutionContext, Graph, Node, NodeError, NodeInput, NodeResolver, NodeResult,
    NullSink, StepSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct MapResolver(HashMap<String, Arc<dyn Node>>);

#[async_trait]
impl NodeResolver for MapResolver {
    async fn resolve(&self, node_id: &str) -> Result<Arc<dyn Node>, NodeError> {
        self.0
            .get(node_id)
            .cloned()
            .ok_or_else(|| NodeError::InvalidRequest(format!("unknown node {node_id}")))
    }
}

fn always_fails(id: &str) -> Arc<dyn Node> {
    Arc::new(FunctionNode::new(id, Arc::new(|_input: &str| Err("boom".to_string()))))
}

fn passthrough(id: &str) -> Arc<dyn Node> {
    Arc::new(FunctionNode::new(id, Arc::new(|input: &str| Ok(input.to_string()))))
}

#[tokio::test]
async fn skip_downstream_marks_dependents_skipped_without_running_them() {
    let mut graph = Graph::new("g1");
    graph
        .add_step(StepSpec::by_id("a", "failer").with_error_policy(ErrorPolicy::SkipDownstream))
        .unwrap();
    graph
        .add_step(StepSpec::by_id("b", "downstream").depends_on(["a".to_string()]))
        .unwrap();

    let resolver = MapResolver(HashMap::from([
        ("failer".to_string(), always_fails("failer")),
        ("downstream".to_string(), passthrough("downstream")),
    ]));

    let result = graph.execute(&resolver, NodeInput::Text("x".to_string()), Arc::new(NullSink)).await;

    assert!(!result.step_results["a"].success);
    let skipped = &result.step_results["b"];
    assert!(!skipped.success);
    assert_eq!(skipped.error_type.as_deref(), Some("skipped"));
}

#[tokio::test]
async fn max_parallel_bounds_concurrent_step_starts() {
    let mut graph = Graph::new("g1").with_max_parallel(2);
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut nodes: HashMap<String, Arc<dyn Node>> = HashMap::new();
    for i in 0..5 {
        let step_id = format!("s{i}");
        let node_id = format!("n{i}");
        graph.add_step(StepSpec::by_id(step_id, node_id.clone())).unwrap();
        nodes.insert(node_id.clone(), slow_tracking_node(&node_id, concurrent.clone(), peak.clone()));
    }

    let resolver = MapResolver(nodes);
    let result = graph.execute(&resolver, NodeInput::Text(String::new()), Arc::new(NullSink)).await;

    assert!(result.success);
    assert!(peak.load(Ordering::SeqCst) <= 2, "observed more than max_parallel steps running at once");
}

fn slow_tracking_node(id: &str, concurrent: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn Node> {
    struct Tracking {
        id: String,
        concurrent: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Node for Tracking {
        fn id(&self) -> &str {
            &self.id
        }
        fn node_type(&self) -> &'static str {
            "test"
        }
        fn is_persistent(&self) -> bool {
            false
        }
        async fn state(&self) -> nodeforge_core::NodeState {
            nodeforge_core::NodeState::Ready
        }
        async fn execute(&self, _ctx: ExecutionContext) -> NodeResult {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            NodeResult::ok(serde_json::Map::new())
        }
        async fn interrupt(&self) {}
        async fn start(&self) -> Result<(), NodeError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), NodeError> {
            Ok(())
        }
        async fn to_info(&self) -> nodeforge_core::NodeInfo {
            unimplemented!()
        }
    }

    Arc::new(Tracking { id: id.to_string(), concurrent, peak })
}
