//! Workflow executor (spec §4.3): builds a validated DAG plan from a
//! [`CronWorkflow`] and runs it node-by-node against the node-handler
//! registry. Grounded in the retrieved workflow engine's worker/state shape
//! (`siumai-extras` orchestrator) combined with the teacher's registry idiom —
//! the teacher has no DAG executor of its own, this module is newly authored
//! in its manner.

pub mod handlers;

use crate::errors::{GatewayError, GatewayResult};
use crate::registry::node_handlers::{NodeContext, NodeHandlerRegistry};
use crate::state::cron::{CronWorkflow, WorkflowNode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

const START_TYPE: &str = "start";

/// A validated, linearized execution order (spec §4.3 "Output: ordered list
/// excluding `start`").
pub struct WorkflowPlan {
    nodes: HashMap<String, WorkflowNode>,
    order: Vec<String>,
}

/// Validates `{version, nodes[], edges[]}` and produces an execution plan.
/// Rejects: not-exactly-one `start`, unreachable nodes, unknown node types,
/// malformed `if_event` conditions, unknown edge endpoints, and cycles.
pub fn build_plan(workflow: &CronWorkflow, registry: &NodeHandlerRegistry) -> GatewayResult<WorkflowPlan> {
    let nodes: HashMap<String, WorkflowNode> = workflow.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();

    let start_nodes: Vec<&WorkflowNode> = workflow.nodes.iter().filter(|n| n.kind == START_TYPE).collect();
    if start_nodes.len() != 1 {
        return Err(GatewayError::InvalidCronWorkflow(format!(
            "workflow must have exactly one start node, found {}",
            start_nodes.len()
        )));
    }
    let start_id = start_nodes[0].id.clone();

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut indegree: HashMap<String, u32> = nodes.keys().map(|id| (id.clone(), 0)).collect();
    for edge in &workflow.edges {
        if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
            return Err(GatewayError::InvalidCronWorkflow(format!(
                "edge references unknown node: {} -> {}",
                edge.from, edge.to
            )));
        }
        adjacency.entry(edge.from.clone()).or_default().push(edge.to.clone());
        *indegree.entry(edge.to.clone()).or_default() += 1;
    }

    // Reachability from start.
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start_id.clone());
    reachable.insert(start_id.clone());
    while let Some(current) = queue.pop_front() {
        for next in adjacency.get(&current).into_iter().flatten() {
            if reachable.insert(next.clone()) {
                queue.push_back(next.clone());
            }
        }
    }
    for id in nodes.keys() {
        if !reachable.contains(id) {
            return Err(GatewayError::InvalidCronWorkflow(format!("node {id} is not reachable from start")));
        }
    }

    // Node type + per-node validation (types are resolved against the
    // registry; `start` is built-in and never looked up).
    for node in workflow.nodes.iter().filter(|n| n.kind != START_TYPE) {
        let handler = crate::registry::node_handlers::resolve(registry, &node.kind)?;
        let config = serde_json::to_value(node).map_err(|e| GatewayError::InvalidCronWorkflow(e.to_string()))?;
        handler.validate(&config)?;
    }

    // Kahn's algorithm over the reachable subgraph, excluding `start`, to
    // produce a deterministic topological order; cycles surface as a
    // mismatch between the number of nodes ordered and nodes reachable.
    let mut local_indegree = indegree.clone();
    let mut ready: VecDeque<String> = local_indegree
        .iter()
        .filter(|(id, &deg)| deg == 0 && reachable.contains(*id))
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::new();
    while let Some(id) = ready.pop_front() {
        if id != start_id {
            order.push(id.clone());
        }
        for next in adjacency.get(&id).into_iter().flatten() {
            let deg = local_indegree.get_mut(next).expect("edge target tracked in indegree");
            *deg -= 1;
            if *deg == 0 {
                ready.push_back(next.clone());
            }
        }
    }
    let reachable_non_start = reachable.len() - 1;
    if order.len() != reachable_non_start {
        return Err(GatewayError::InvalidCronWorkflow("workflow graph contains a cycle".to_string()));
    }

    Ok(WorkflowPlan { nodes, order })
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeTrace {
    pub node_id: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs a plan to completion (spec §4.3 "Execution"). Returns the full trace
/// plus the first node failure, if any — the caller decides whether that
/// aborts the enclosing cron job.
pub async fn execute(plan: &WorkflowPlan, mut ctx: NodeContext, registry: &NodeHandlerRegistry) -> (Vec<NodeTrace>, Option<String>) {
    let mut trace = Vec::new();
    let mut stopped = false;
    let mut first_failure: Option<String> = None;
    let mut prior_failed_no_continue = false;

    for node_id in &plan.order {
        let node = plan.nodes.get(node_id).expect("plan only orders known nodes");
        let started_at = Utc::now();

        if stopped || prior_failed_no_continue {
            trace.push(NodeTrace {
                node_id: node_id.clone(),
                status: NodeStatus::Skipped,
                started_at,
                finished_at: started_at,
                error: None,
            });
            continue;
        }

        let handler = match crate::registry::node_handlers::resolve(registry, &node.kind) {
            Ok(h) => h,
            Err(e) => {
                let message = e.to_string();
                first_failure.get_or_insert_with(|| format!("workflow node {node_id} failed: {message}"));
                trace.push(NodeTrace {
                    node_id: node_id.clone(),
                    status: NodeStatus::Failed,
                    started_at,
                    finished_at: Utc::now(),
                    error: Some(message),
                });
                if !node.continue_on_error {
                    prior_failed_no_continue = true;
                }
                continue;
            }
        };

        let config = serde_json::to_value(node).unwrap_or(serde_json::Value::Null);
        match handler.run(&config, &ctx).await {
            Ok(outcome) => {
                ctx.node_outputs.insert(node_id.clone(), outcome.output);
                if outcome.stop {
                    stopped = true;
                }
                trace.push(NodeTrace {
                    node_id: node_id.clone(),
                    status: NodeStatus::Succeeded,
                    started_at,
                    finished_at: Utc::now(),
                    error: None,
                });
            }
            Err(e) => {
                let message = e.to_string();
                first_failure.get_or_insert_with(|| format!("workflow node {node_id} failed: {message}"));
                trace.push(NodeTrace {
                    node_id: node_id.clone(),
                    status: NodeStatus::Failed,
                    started_at,
                    finished_at: Utc::now(),
                    error: Some(message),
                });
                if !node.continue_on_error {
                    prior_failed_no_continue = true;
                }
            }
        }
    }

    (trace, first_failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::node_handlers::NodeHandlerRegistry;
    use crate::state::cron::WorkflowEdge;

    fn node(id: &str, kind: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            kind: kind.to_string(),
            continue_on_error: false,
            text: None,
            delay_seconds: None,
            if_condition: None,
        }
    }

    fn registry() -> NodeHandlerRegistry {
        let mut r = NodeHandlerRegistry::new();
        r.register("delay", Box::new(handlers::DelayHandler));
        r
    }

    #[test]
    fn rejects_unreachable_nodes() {
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), node("orphan", "delay")],
            edges: vec![],
        };
        let err = build_plan(&workflow, &registry()).unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn rejects_unknown_node_type() {
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), node("n1", "mystery")],
            edges: vec![WorkflowEdge {
                from: "start".to_string(),
                to: "n1".to_string(),
            }],
        };
        let err = build_plan(&workflow, &registry()).unwrap_err();
        assert!(err.to_string().contains("unsupported type=\"mystery\""));
    }

    #[test]
    fn rejects_cycles() {
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), node("n1", "delay"), node("n2", "delay")],
            edges: vec![
                WorkflowEdge { from: "start".to_string(), to: "n1".to_string() },
                WorkflowEdge { from: "n1".to_string(), to: "n2".to_string() },
                WorkflowEdge { from: "n2".to_string(), to: "n1".to_string() },
            ],
        };
        let err = build_plan(&workflow, &registry()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn orders_linear_chain() {
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), node("n1", "delay"), node("n2", "delay")],
            edges: vec![
                WorkflowEdge { from: "start".to_string(), to: "n1".to_string() },
                WorkflowEdge { from: "n1".to_string(), to: "n2".to_string() },
            ],
        };
        let plan = build_plan(&workflow, &registry()).unwrap();
        assert_eq!(plan.order, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn continue_on_error_runs_remaining_nodes() {
        let mut n1 = node("n1", "fail_always");
        n1.continue_on_error = true;
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), n1, node("n2", "delay")],
            edges: vec![
                WorkflowEdge { from: "start".to_string(), to: "n1".to_string() },
                WorkflowEdge { from: "n1".to_string(), to: "n2".to_string() },
            ],
        };
        let mut registry = registry();
        registry.register("fail_always", Box::new(handlers::test_support::AlwaysFailHandler));
        let plan = build_plan(&workflow, &registry).unwrap();
        let (trace, first_error) = execute(&plan, NodeContext::default(), &registry).await;
        assert_eq!(trace[0].status, NodeStatus::Failed);
        assert_eq!(trace[1].status, NodeStatus::Succeeded);
        assert!(first_error.unwrap().contains("workflow node n1 failed"));
    }

    #[tokio::test]
    async fn default_registry_resolves_spec_named_text_event_and_if_event_nodes() {
        // Regression test (spec §8.4): node handlers were once registered as
        // "text"/"if" instead of the spec's "text_event"/"if_event", so a
        // workflow built from those literal node types was rejected at
        // `build_plan` with `unsupported type="text_event"`.
        let registries = crate::registry::Registries::default_set();

        let mut n1 = node("n1", "text_event");
        n1.text = Some("hello".to_string());
        let mut n2 = node("n2", "if_event");
        n2.if_condition = Some("channel == \"console\"".to_string());

        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), n1, n2],
            edges: vec![
                WorkflowEdge { from: "start".to_string(), to: "n1".to_string() },
                WorkflowEdge { from: "n1".to_string(), to: "n2".to_string() },
            ],
        };

        let plan = build_plan(&workflow, &registries.node_handlers).unwrap();
        assert_eq!(plan.order, vec!["n1".to_string(), "n2".to_string()]);

        let ctx = NodeContext {
            channel: Some("console".to_string()),
            ..NodeContext::default()
        };
        let (trace, first_failure) = execute(&plan, ctx, &registries.node_handlers).await;
        assert!(first_failure.is_none());
        assert!(trace.iter().all(|t| t.status == NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn failure_without_continue_skips_remaining_nodes() {
        let workflow = CronWorkflow {
            version: 1,
            nodes: vec![node("start", "start"), node("n1", "fail_always"), node("n2", "delay")],
            edges: vec![
                WorkflowEdge { from: "start".to_string(), to: "n1".to_string() },
                WorkflowEdge { from: "n1".to_string(), to: "n2".to_string() },
            ],
        };
        let mut registry = registry();
        registry.register("fail_always", Box::new(handlers::test_support::AlwaysFailHandler));
        let plan = build_plan(&workflow, &registry).unwrap();
        let (trace, _) = execute(&plan, NodeContext::default(), &registry).await;
        assert_eq!(trace[0].status, NodeStatus::Failed);
        assert_eq!(trace[1].status, NodeStatus::Skipped);
    }
}
