//! Workflow execution engine
//!
//! The engine interprets a validated workflow graph: it seeds the root
//! variable scope from declarations and caller inputs, walks the nodes
//! in topological order following condition outcomes at runtime, and
//! dispatches each node to its executor. Loop bodies and parallel
//! branches are excluded from the main walk; their parent constructs run
//! them. Everything observable flows through the per-execution event bus.

use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::workflow::{validation, NodeKind, Workflow};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod context;
pub mod events;
pub mod execution;
mod executors;

pub use context::VariableContext;
pub use events::{EventBus, EventFilter, EventKind, EventStream, ExecutionEvent};
pub use execution::{
    Execution, ExecutionMonitor, ExecutionStatus, NodeExecution, NodeStatus, Progress,
};

use execution::ExecutionState;
use executors::{run_node, ExecutionRuntime};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Fail template rendering on undefined variables.
    pub strict_templates: bool,
    /// What an undefined variable renders as when not strict.
    pub missing_placeholder: String,
    /// Deadline for one `tools/call` round trip.
    pub tool_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strict_templates: false,
            missing_placeholder: String::new(),
            tool_timeout: crate::transport::DEFAULT_CALL_TIMEOUT,
        }
    }
}

pub struct Engine {
    pool: Arc<ConnectionPool>,
    options: EngineOptions,
    monitor: parking_lot::RwLock<Option<ExecutionMonitor>>,
    cancel: parking_lot::RwLock<Option<CancellationToken>>,
}

impl Engine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_options(pool, EngineOptions::default())
    }

    pub fn with_options(pool: Arc<ConnectionPool>, options: EngineOptions) -> Self {
        Self {
            pool,
            options,
            monitor: parking_lot::RwLock::new(None),
            cancel: parking_lot::RwLock::new(None),
        }
    }

    /// Monitor for the current (or most recent) execution. Published
    /// before the first node runs, so a subscriber racing `execute` can
    /// still attach.
    pub fn monitor(&self) -> Option<ExecutionMonitor> {
        self.monitor.read().clone()
    }

    /// Cancel the current execution. In-flight node executors observe
    /// the token at their next suspension point.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel.read().as_ref() {
            token.cancel();
        }
    }

    /// Execute a workflow to completion. Validation problems surface as
    /// `Err` before any node runs; runtime failures are reported in the
    /// returned [`Execution`]'s status and error.
    pub async fn execute(
        &self,
        workflow: Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<Execution> {
        Ok(self.start(workflow, inputs)?.run().await)
    }

    /// Validate inputs and prepare a run without driving it. The bus is
    /// live from this point, so a subscriber attached through the
    /// handle's monitor sees every event, `ExecutionStarted` included.
    pub fn start(
        &self,
        workflow: Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionHandle> {
        let workflow = Arc::new(workflow);
        let root = seed_context(&workflow, &inputs)?;

        let state = Arc::new(ExecutionState::new(
            workflow.name.clone(),
            workflow.nodes.len(),
        ));
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();

        let monitor = ExecutionMonitor {
            state: state.clone(),
            bus: bus.clone(),
            root: root.clone(),
        };
        *self.monitor.write() = Some(monitor.clone());
        *self.cancel.write() = Some(cancel.clone());

        let rt = ExecutionRuntime {
            workflow,
            pool: self.pool.clone(),
            state,
            bus,
            cancel,
            options: self.options.clone(),
        };

        Ok(ExecutionHandle {
            monitor,
            future: Box::pin(drive(rt, root)),
        })
    }
}

/// A prepared run: the monitor is live, the traversal has not started.
pub struct ExecutionHandle {
    monitor: ExecutionMonitor,
    future: futures::future::BoxFuture<'static, Execution>,
}

impl ExecutionHandle {
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Drive the run to its terminal status.
    pub async fn run(self) -> Execution {
        self.future.await
    }
}

/// Run a prepared execution: emit lifecycle events, traverse, settle on
/// exactly one terminal status.
async fn drive(rt: ExecutionRuntime, root: VariableContext) -> Execution {
    let state = rt.state.clone();
    info!(workflow = %rt.workflow.name, execution = %state.id, "execution started");
    rt.emit(ExecutionEvent::new(EventKind::ExecutionStarted, state.id));

    match traverse(&rt, &root).await {
        Ok(()) => {
            if state.try_finish(ExecutionStatus::Completed, None) {
                rt.emit(ExecutionEvent::new(EventKind::ExecutionCompleted, state.id));
                info!(execution = %state.id, "execution completed");
            }
        },
        Err(e) if e.is_cancellation() => {
            if state.try_finish(ExecutionStatus::Cancelled, Some(e.to_string())) {
                rt.emit(ExecutionEvent::new(EventKind::ExecutionCancelled, state.id));
                info!(execution = %state.id, "execution cancelled");
            }
        },
        Err(e) => {
            if state.try_finish(ExecutionStatus::Failed, Some(e.to_string())) {
                rt.emit(
                    ExecutionEvent::new(EventKind::ExecutionFailed, state.id)
                        .with_error(e.to_string()),
                );
                info!(execution = %state.id, error = %e, "execution failed");
            }
        },
    }

    state.to_execution(root.snapshot())
}

/// Walk the topological order, executing activated nodes and following
/// condition outcomes. Reaching an end node terminates the walk.
async fn traverse(rt: &ExecutionRuntime, root: &VariableContext) -> Result<()> {
    let workflow = &rt.workflow;
    let order = validation::topological_order(workflow);
    let body_nodes = collect_body_nodes(workflow);

    let start = workflow
        .start_node()
        .ok_or_else(|| Error::Validation("workflow has no start node".to_string()))?;

    let mut activated: HashSet<String> = HashSet::new();
    activated.insert(start.id.clone());

    for node_id in &order {
        if body_nodes.contains(node_id.as_str()) || !activated.contains(node_id.as_str()) {
            continue;
        }
        if rt.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let node = workflow
            .node(node_id)
            .ok_or_else(|| Error::Internal(format!("unknown node in order: {}", node_id)))?;

        let output = run_node(rt, node, root).await?;

        match &node.kind {
            NodeKind::End { .. } => return Ok(()),
            NodeKind::Condition { .. } => {
                let branch = matches!(output, Some(Value::Bool(true)));
                let literal = if branch { "true" } else { "false" };
                for edge in workflow.edges_from(node_id) {
                    if edge.condition.as_deref() == Some(literal) {
                        activated.insert(edge.to.clone());
                    } else if edge.is_conditional() && !activated.contains(&edge.to) {
                        // The bypassed target never runs; no NodeExecution
                        // record is created for it.
                        rt.emit(
                            ExecutionEvent::new(EventKind::NodeSkipped, rt.state.id)
                                .with_node(edge.to.clone()),
                        );
                    }
                }
                debug!(node = %node_id, outcome = branch, "condition branch taken");
            },
            _ => {
                for edge in workflow.edges_from(node_id) {
                    if !edge.is_conditional() {
                        activated.insert(edge.to.clone());
                    }
                }
            },
        }
    }

    Ok(())
}

/// Nodes owned by loop bodies and parallel branches run under their
/// parent construct, never from the main walk.
fn collect_body_nodes(workflow: &Workflow) -> HashSet<&str> {
    let mut body_nodes = HashSet::new();
    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::Loop { body, .. } => {
                body_nodes.extend(body.iter().map(String::as_str));
            },
            NodeKind::Parallel { branches, .. } => {
                for branch in branches {
                    body_nodes.extend(branch.iter().map(String::as_str));
                }
            },
            _ => {},
        }
    }
    body_nodes
}

/// Seed the root scope: declared defaults, caller inputs (type-checked
/// against their declarations), and a required-variable check.
fn seed_context(workflow: &Workflow, inputs: &HashMap<String, Value>) -> Result<VariableContext> {
    let ctx = VariableContext::new();

    for decl in &workflow.variables {
        match inputs.get(&decl.name) {
            Some(value) => {
                if !decl.var_type.matches(value) {
                    return Err(Error::Validation(format!(
                        "input {} must be a {}, got {}",
                        decl.name,
                        decl.var_type.as_str(),
                        type_of(value)
                    )));
                }
                ctx.declare(&decl.name, value.clone());
            },
            None => match &decl.default {
                Some(default) => ctx.declare(&decl.name, default.clone()),
                None if decl.required => {
                    return Err(Error::Validation(format!(
                        "required variable {} was not supplied",
                        decl.name
                    )));
                },
                None => {},
            },
        }
    }

    for (name, value) in inputs {
        if workflow.variable(name).is_none() {
            ctx.declare(name, value.clone());
        }
    }

    Ok(ctx)
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use serde_json::json;

    fn chain_workflow() -> Workflow {
        Workflow::from_yaml(
            r#"
version: "1.0"
name: seed-test
variables:
  - name: greeting
    type: string
    required: true
  - name: count
    type: number
    default: 3
nodes:
  - id: start
    type: start
  - id: finish
    type: end
edges:
  - from: start
    to: finish
"#,
        )
        .unwrap()
    }

    #[test]
    fn seed_rejects_missing_required() {
        let workflow = chain_workflow();
        let err = seed_context(&workflow, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("greeting"));
    }

    #[test]
    fn seed_applies_defaults_and_type_checks() {
        let workflow = chain_workflow();

        let mut inputs = HashMap::new();
        inputs.insert("greeting".to_string(), json!("hi"));
        let ctx = seed_context(&workflow, &inputs).unwrap();
        assert_eq!(ctx.get("count"), Some(json!(3)));
        assert_eq!(ctx.get("greeting"), Some(json!("hi")));

        inputs.insert("greeting".to_string(), json!(42));
        let err = seed_context(&workflow, &inputs).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[tokio::test]
    async fn validation_failure_produces_no_execution_events() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let engine = Engine::new(pool);
        let result = engine.execute(chain_workflow(), HashMap::new()).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(engine.monitor().is_none());
    }
}
