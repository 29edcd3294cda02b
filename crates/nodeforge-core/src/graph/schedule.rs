//! Topological scheduler (§4.5 steps 2-7): bounded-parallelism execution of a
//! [`Graph`]'s steps respecting dependencies and per-step error policy.

use super::{CancelToken, ErrorPolicy, Graph, GraphResult, NodeRef, NodeResolver, Step, StepInput};
use crate::error::NodeError;
use crate::event::{Event, EventSink, EventType};
use crate::node::{ExecutionContext, Node, NodeInput, NodeResult};
use crate::parser::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
    Cancelled,
}

fn is_terminal(status: Status) -> bool {
    !matches!(status, Status::Pending | Status::Running)
}

fn compute_input(step: &Step, dep_results: &HashMap<String, NodeResult>, graph_input: &NodeInput) -> NodeInput {
    match &step.input {
        StepInput::Static(v) => v.clone(),
        StepInput::Dynamic(f) => f(dep_results),
        StepInput::Inherited => {
            if step.depends_on.is_empty() {
                graph_input.clone()
            } else {
                NodeInput::Structured(serde_json::to_value(dep_results).unwrap_or(serde_json::Value::Null))
            }
        }
    }
}

async fn resolve(node_ref: &NodeRef, resolver: &dyn NodeResolver) -> Result<Arc<dyn Node>, NodeError> {
    match node_ref {
        NodeRef::Direct(node) => Ok(node.clone()),
        NodeRef::Id(id) => resolver.resolve(id).await,
    }
}

async fn execute_with_policy(
    node: Arc<dyn Node>,
    input: NodeInput,
    parser: Option<Arc<dyn Parser>>,
    sink: Arc<dyn EventSink>,
    policy: ErrorPolicy,
) -> NodeResult {
    let max_attempts = match policy {
        ErrorPolicy::Retry(n) => n.max(1),
        _ => 1,
    };
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let mut ctx = ExecutionContext::new(input.clone()).with_sink(sink.clone());
        if let Some(p) = &parser {
            ctx = ctx.with_parser(p.clone());
        }
        let mut result = node.execute(ctx).await;
        if result.success || attempt >= max_attempts {
            if matches!(policy, ErrorPolicy::Retry(_)) {
                result.attributes.insert("retry_attempts".to_string(), attempt.into());
            }
            return result;
        }
        let backoff = Duration::from_millis(50 * 2u64.pow(attempt.min(6) as u32));
        tokio::time::sleep(backoff).await;
    }
}

/// Marks every step transitively downstream of `failed_id` as `Skipped` without
/// running them (§4.5.5 `skip_downstream`).
fn skip_transitively(
    failed_id: &str,
    children: &HashMap<String, Vec<String>>,
    status: &mut HashMap<String, Status>,
    results: &mut HashMap<String, NodeResult>,
) {
    let Some(kids) = children.get(failed_id).cloned() else { return };
    for kid in kids {
        if status.get(&kid).copied() == Some(Status::Pending) {
            status.insert(kid.clone(), Status::Skipped);
            results.insert(
                kid.clone(),
                NodeResult::err(format!("skipped: upstream step {failed_id} failed"), "skipped"),
            );
            skip_transitively(&kid, children, status, results);
        }
    }
}

pub(crate) async fn run(
    graph: &Graph,
    resolver: &dyn NodeResolver,
    input: NodeInput,
    sink: Arc<dyn EventSink>,
    cancel: &CancelToken,
) -> GraphResult {
    let started = Instant::now();
    let steps = graph.steps();

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for step in steps.values() {
        for dep in &step.depends_on {
            children.entry(dep.clone()).or_default().push(step.id.clone());
        }
    }

    let mut status: HashMap<String, Status> =
        steps.keys().map(|id| (id.clone(), Status::Pending)).collect();
    let mut results: HashMap<String, NodeResult> = HashMap::new();
    let mut execution_order: Vec<String> = Vec::new();
    let mut in_flight: JoinSet<(String, NodeResult)> = JoinSet::new();
    // Tracks the node behind each still-running step so an abort can call `interrupt()`
    // on it instead of just yanking the task. A step whose task errored out (rather
    // than completing) can't be identified from `JoinError` alone and so lingers here
    // until the whole run aborts — harmless, since `interrupt()` on an already-finished
    // node is a no-op.
    let mut running_nodes: HashMap<String, Arc<dyn Node>> = HashMap::new();
    let mut aborting = false;

    loop {
        if !aborting && cancel.is_cancelled() {
            aborting = true;
        }

        if !aborting {
            loop {
                if in_flight.len() >= graph.max_parallel() {
                    break;
                }
                let next_ready = steps
                    .values()
                    .find(|s| {
                        status[&s.id] == Status::Pending
                            && s.depends_on.iter().all(|d| is_terminal(status[d]))
                    })
                    .map(|s| s.id.clone());

                let Some(step_id) = next_ready else { break };
                let step = &steps[&step_id];

                let node = resolve(&step.node_ref, resolver).await;
                let node = match node {
                    Ok(node) => node,
                    Err(e) => {
                        status.insert(step_id.clone(), Status::Failed);
                        results.insert(step_id.clone(), NodeResult::from_node_error(&e));
                        execution_order.push(step_id.clone());
                        if matches!(step.error_policy, ErrorPolicy::FailFast) {
                            aborting = true;
                        } else if matches!(step.error_policy, ErrorPolicy::SkipDownstream) {
                            skip_transitively(&step_id, &children, &mut status, &mut results);
                        }
                        continue;
                    }
                };

                let dep_results: HashMap<String, NodeResult> = step
                    .depends_on
                    .iter()
                    .filter_map(|d| results.get(d).map(|r| (d.clone(), r.clone())))
                    .collect();
                let step_input = compute_input(step, &dep_results, &input);
                let parser = step.parser_override.clone();
                let policy = step.error_policy;
                let sink_clone = sink.clone();
                let sid = step_id.clone();

                status.insert(step_id.clone(), Status::Running);
                running_nodes.insert(step_id.clone(), node.clone());
                sink_clone
                    .emit(Event::new(EventType::StepStarted).with_data("step_id", sid.clone()))
                    .await;

                in_flight.spawn(async move {
                    let result = execute_with_policy(node, step_input, parser, sink_clone, policy).await;
                    (sid, result)
                });
            }
        }

        if in_flight.is_empty() && !aborting {
            break;
        }

        if !aborting {
            tokio::select! {
                _ = cancel.cancelled() => {
                    aborting = true;
                }
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((sid, result))) => {
                            running_nodes.remove(&sid);
                            execution_order.push(sid.clone());
                            let step = &steps[&sid];
                            let event_type = if result.success {
                                EventType::StepCompleted
                            } else {
                                EventType::StepFailed
                            };
                            sink.emit(Event::new(event_type).with_data("step_id", sid.clone())).await;

                            if result.success {
                                status.insert(sid.clone(), Status::Done);
                            } else {
                                status.insert(sid.clone(), Status::Failed);
                                match step.error_policy {
                                    ErrorPolicy::FailFast => aborting = true,
                                    ErrorPolicy::SkipDownstream => {
                                        skip_transitively(&sid, &children, &mut status, &mut results)
                                    }
                                    ErrorPolicy::Continue | ErrorPolicy::Retry(_) => {}
                                }
                            }
                            results.insert(sid, result);
                        }
                        Some(Err(join_error)) => {
                            if !join_error.is_cancelled() {
                                aborting = true;
                            }
                        }
                        None => {}
                    }
                }
            }
        }

        if aborting {
            for node in running_nodes.values() {
                node.interrupt().await;
            }
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            running_nodes.clear();

            for (id, st) in status.iter_mut() {
                if is_terminal(*st) {
                    continue;
                }
                let was_running = *st == Status::Running;
                *st = Status::Cancelled;
                results.insert(
                    id.clone(),
                    if was_running {
                        NodeResult::err("operation interrupted", "interrupted")
                    } else {
                        NodeResult::err("graph run aborted before this step started", "cancelled")
                    },
                );
            }
            break;
        }
    }

    let success = !status.values().any(|s| matches!(s, Status::Failed | Status::Cancelled));

    GraphResult {
        success,
        step_results: results,
        execution_order,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;
    use crate::graph::StepSpec;
    use crate::node::function::FunctionNode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SessionStub {
        nodes: HashMap<String, Arc<dyn Node>>,
    }

    #[async_trait]
    impl NodeResolver for SessionStub {
        async fn resolve(&self, node_id: &str) -> Result<Arc<dyn Node>, NodeError> {
            self.nodes
                .get(node_id)
                .cloned()
                .ok_or_else(|| NodeError::InvalidRequest(format!("unknown node {node_id}")))
        }
    }

    fn append_bang() -> Arc<dyn Node> {
        Arc::new(FunctionNode::new(
            "append",
            Arc::new(|input: &str| Ok(format!("{input}!"))),
        ))
    }

    #[tokio::test]
    async fn two_step_chain_passes_upstream_output_through_input_fn() {
        let mut graph = Graph::new("g1");
        graph
            .add_step(StepSpec::by_id("a", "s1").with_static_input("x"))
            .unwrap();
        graph
            .add_step(
                StepSpec::by_id("b", "s2")
                    .depends_on(["a".to_string()])
                    .with_input(StepInput::Dynamic(Arc::new(|deps: &HashMap<String, NodeResult>| {
                        let output = deps["a"].attributes["output"].as_str().unwrap_or_default();
                        NodeInput::Text(format!("{output}!"))
                    }))),
            )
            .unwrap();

        let resolver = SessionStub {
            nodes: HashMap::from([
                ("s1".to_string(), append_bang()),
                ("s2".to_string(), append_bang()),
            ]),
        };

        let result = graph
            .execute(&resolver, NodeInput::Text(String::new()), Arc::new(NullSink))
            .await;
        assert!(result.success);
        assert_eq!(result.step_results["b"].attributes["output"], "x!!");
    }

    #[tokio::test]
    async fn fail_fast_cancels_unstarted_sibling() {
        let mut graph = Graph::new("g1");
        graph.add_step(StepSpec::by_id("a", "fails")).unwrap();
        graph.add_step(StepSpec::by_id("b", "never")).unwrap();

        struct AlwaysFails;
        #[async_trait]
        impl Node for AlwaysFails {
            fn id(&self) -> &str {
                "fails"
            }
            fn node_type(&self) -> &'static str {
                "test"
            }
            fn is_persistent(&self) -> bool {
                false
            }
            async fn state(&self) -> crate::node::NodeState {
                crate::node::NodeState::Ready
            }
            async fn execute(&self, _ctx: ExecutionContext) -> NodeResult {
                NodeResult::err("boom", "internal_error")
            }
            async fn interrupt(&self) {}
            async fn start(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn to_info(&self) -> crate::node::NodeInfo {
                unimplemented!()
            }
        }

        let never_ran = Arc::new(AtomicUsize::new(0));
        let never_ran_clone = never_ran.clone();
        let never = FunctionNode::new("never", Arc::new(move |input: &str| {
            never_ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(input.to_string())
        }));

        let resolver = SessionStub {
            nodes: HashMap::from([
                ("fails".to_string(), Arc::new(AlwaysFails) as Arc<dyn Node>),
                ("never".to_string(), Arc::new(never) as Arc<dyn Node>),
            ]),
        };

        let result = graph
            .execute(&resolver, NodeInput::Text("x".to_string()), Arc::new(NullSink))
            .await;
        assert!(!result.success);
        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_interrupts_running_nodes_and_records_cancelled_results() {
        let mut graph = Graph::new("g1").with_max_parallel(2);
        graph.add_step(StepSpec::by_id("a", "fails")).unwrap();
        graph.add_step(StepSpec::by_id("b", "slow")).unwrap();
        graph
            .add_step(StepSpec::by_id("c", "never").depends_on(["b".to_string()]))
            .unwrap();

        struct AlwaysFails;
        #[async_trait]
        impl Node for AlwaysFails {
            fn id(&self) -> &str {
                "fails"
            }
            fn node_type(&self) -> &'static str {
                "test"
            }
            fn is_persistent(&self) -> bool {
                false
            }
            async fn state(&self) -> crate::node::NodeState {
                crate::node::NodeState::Ready
            }
            async fn execute(&self, _ctx: ExecutionContext) -> NodeResult {
                NodeResult::err("boom", "internal_error")
            }
            async fn interrupt(&self) {}
            async fn start(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn to_info(&self) -> crate::node::NodeInfo {
                unimplemented!()
            }
        }

        struct SlowUntilInterrupted {
            interrupted: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Node for SlowUntilInterrupted {
            fn id(&self) -> &str {
                "slow"
            }
            fn node_type(&self) -> &'static str {
                "test"
            }
            fn is_persistent(&self) -> bool {
                false
            }
            async fn state(&self) -> crate::node::NodeState {
                crate::node::NodeState::Ready
            }
            async fn execute(&self, _ctx: ExecutionContext) -> NodeResult {
                tokio::time::sleep(Duration::from_secs(30)).await;
                NodeResult::ok(serde_json::Map::new())
            }
            async fn interrupt(&self) {
                self.interrupted.fetch_add(1, Ordering::SeqCst);
            }
            async fn start(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn to_info(&self) -> crate::node::NodeInfo {
                unimplemented!()
            }
        }

        let interrupted = Arc::new(AtomicUsize::new(0));
        let never_ran = Arc::new(AtomicUsize::new(0));
        let never_ran_clone = never_ran.clone();
        let never = FunctionNode::new(
            "never",
            Arc::new(move |input: &str| {
                never_ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(input.to_string())
            }),
        );

        let resolver = SessionStub {
            nodes: HashMap::from([
                ("fails".to_string(), Arc::new(AlwaysFails) as Arc<dyn Node>),
                (
                    "slow".to_string(),
                    Arc::new(SlowUntilInterrupted { interrupted: interrupted.clone() }) as Arc<dyn Node>,
                ),
                ("never".to_string(), Arc::new(never) as Arc<dyn Node>),
            ]),
        };

        let result = graph
            .execute(&resolver, NodeInput::Text("x".to_string()), Arc::new(NullSink))
            .await;

        assert!(!result.success);
        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
        assert_eq!(interrupted.load(Ordering::SeqCst), 1, "the in-flight node should have been interrupted");
        assert_eq!(result.step_results["b"].error_type.as_deref(), Some("interrupted"));
        assert_eq!(result.step_results["c"].error_type.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn retry_policy_succeeds_on_a_later_attempt_and_reports_attempts() {
        let mut graph = Graph::new("g1");
        graph
            .add_step(StepSpec::by_id("a", "flaky").with_error_policy(ErrorPolicy::Retry(3)))
            .unwrap();

        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();
        struct Flaky {
            attempt: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Node for Flaky {
            fn id(&self) -> &str {
                "flaky"
            }
            fn node_type(&self) -> &'static str {
                "test"
            }
            fn is_persistent(&self) -> bool {
                false
            }
            async fn state(&self) -> crate::node::NodeState {
                crate::node::NodeState::Ready
            }
            async fn execute(&self, _ctx: ExecutionContext) -> NodeResult {
                let n = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    NodeResult::err("not yet", "internal_error")
                } else {
                    NodeResult::ok(serde_json::Map::new())
                }
            }
            async fn interrupt(&self) {}
            async fn start(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), NodeError> {
                Ok(())
            }
            async fn to_info(&self) -> crate::node::NodeInfo {
                unimplemented!()
            }
        }
        let _ = attempt_clone;

        let resolver = SessionStub {
            nodes: HashMap::from([(
                "flaky".to_string(),
                Arc::new(Flaky { attempt: attempt.clone() }) as Arc<dyn Node>,
            )]),
        };

        let result = graph
            .execute(&resolver, NodeInput::Text(String::new()), Arc::new(NullSink))
            .await;
        assert!(result.success);
        assert_eq!(result.step_results["a"].attributes["retry_attempts"], 2);
    }
}
