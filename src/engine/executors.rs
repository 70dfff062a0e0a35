//! Node executors
//!
//! One executor per node kind, dispatched over the tagged node enum.
//! Executors see the variable context and, for mcp_tool nodes, the
//! connection pool; everything else they need travels in the shared
//! [`ExecutionRuntime`].

use crate::engine::context::VariableContext;
use crate::engine::events::{EventBus, EventKind, ExecutionEvent};
use crate::engine::execution::ExecutionState;
use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::expr::{self, template, EvalOptions};
use crate::pool::ConnectionPool;
use crate::workflow::{MergeStrategy, Node, NodeKind, Workflow};
use futures::future::{join_all, select_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a node executor can reach, shared across branches.
#[derive(Clone)]
pub(crate) struct ExecutionRuntime {
    pub workflow: Arc<Workflow>,
    pub pool: Arc<ConnectionPool>,
    pub state: Arc<ExecutionState>,
    pub bus: Arc<EventBus>,
    pub cancel: CancellationToken,
    pub options: EngineOptions,
}

impl ExecutionRuntime {
    pub fn emit(&self, event: ExecutionEvent) {
        self.bus.publish(event);
    }

    fn event(&self, kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(kind, self.state.id)
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            strict: self.options.strict_templates,
            missing_placeholder: self.options.missing_placeholder.clone(),
        }
    }

    /// Write a variable and announce the change.
    fn set_variable(&self, ctx: &VariableContext, name: &str, value: Value) {
        ctx.set(name, value);
        self.emit(
            self.event(EventKind::VariableChanged)
                .with_metadata("variable", Value::String(name.to_string())),
        );
    }

    /// A branch runtime shares everything but gets its own cancellation
    /// scope, so losing branches can be cancelled without touching the
    /// engine's token.
    fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self.clone() }
    }
}

/// Run one node: record lifecycle, emit events, dispatch to the
/// kind-specific executor. Returns the node's output value, if any.
pub(crate) fn run_node<'a>(
    rt: &'a ExecutionRuntime,
    node: &'a Node,
    ctx: &'a VariableContext,
) -> BoxFuture<'a, Result<Option<Value>>> {
    async move {
        if rt.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let index = rt.state.begin_node(&node.id, ctx.snapshot());
        rt.emit(rt.event(EventKind::NodeStarted).with_node(&node.id));
        debug!(node = %node.id, kind = node.kind.type_name(), "node started");

        match execute_kind(rt, node, ctx).await {
            Ok(output) => {
                rt.state.complete_node(index, output.clone());
                rt.emit(rt.event(EventKind::NodeCompleted).with_node(&node.id));
                let progress = rt.state.progress();
                rt.emit(
                    rt.event(EventKind::ProgressUpdate)
                        .with_metadata("completed_nodes", json!(progress.completed_nodes))
                        .with_metadata("total_nodes", json!(progress.total_nodes))
                        .with_metadata("percent_complete", json!(progress.percent_complete)),
                );
                Ok(output)
            },
            Err(e) => {
                rt.state.fail_node(index, &e.to_string());
                rt.emit(
                    rt.event(EventKind::NodeFailed)
                        .with_node(&node.id)
                        .with_error(e.to_string()),
                );
                Err(e.at_node(&node.id))
            },
        }
    }
    .boxed()
}

async fn execute_kind(
    rt: &ExecutionRuntime,
    node: &Node,
    ctx: &VariableContext,
) -> Result<Option<Value>> {
    match &node.kind {
        NodeKind::Start | NodeKind::Passthrough => Ok(None),

        NodeKind::End { return_expr } => match return_expr {
            Some(expr) => {
                let value = template::evaluate_value(expr, ctx, &rt.eval_options())?;
                rt.state.set_return_value(value.clone());
                Ok(Some(value))
            },
            None => Ok(None),
        },

        NodeKind::Transform { input, expression, output } => {
            let input_value = ctx
                .get(input)
                .ok_or_else(|| Error::UndefinedVariable(input.clone()))?;
            let value = expr::evaluate_transform(expression, &input_value, ctx, &rt.eval_options())?;
            rt.set_variable(ctx, output, value.clone());
            Ok(Some(value))
        },

        NodeKind::Condition { expression } => {
            let outcome = expr::evaluate_condition(expression, ctx)?;
            Ok(Some(Value::Bool(outcome)))
        },

        NodeKind::McpTool { server, tool, params, output } => {
            execute_mcp_tool(rt, ctx, server, tool, params, output).await
        },

        NodeKind::Loop { collection, iterator, body, break_condition } => {
            execute_loop(rt, ctx, collection, iterator, body, break_condition.as_deref()).await
        },

        NodeKind::Parallel { branches, merge } => {
            execute_parallel(rt, ctx, branches, *merge).await
        },
    }
}

/// Resolve parameters, acquire a pooled connection, call the tool, and
/// release the connection on every exit path after acquisition.
async fn execute_mcp_tool(
    rt: &ExecutionRuntime,
    ctx: &VariableContext,
    server: &str,
    tool: &str,
    params: &std::collections::HashMap<String, String>,
    output: &str,
) -> Result<Option<Value>> {
    let options = rt.eval_options();
    let mut arguments = serde_json::Map::new();
    for (name, expr_text) in params {
        arguments.insert(
            name.clone(),
            template::evaluate_value(expr_text, ctx, &options)?,
        );
    }

    let conn = tokio::select! {
        _ = rt.cancel.cancelled() => return Err(Error::Cancelled),
        conn = rt.pool.get(server) => conn?,
    };

    let result = tokio::select! {
        _ = rt.cancel.cancelled() => Err(Error::Cancelled),
        result = conn.call_tool(tool, Value::Object(arguments), rt.options.tool_timeout) => result,
    };

    rt.pool.release(server);

    let value = result?;
    rt.set_variable(ctx, output, value.clone());
    Ok(Some(value))
}

/// Iterate the collection, binding the iterator in a child scope per
/// element. The break condition is checked at the top of each iteration,
/// against the freshly bound element, so a matching element stops the
/// loop before its body runs.
async fn execute_loop(
    rt: &ExecutionRuntime,
    ctx: &VariableContext,
    collection: &str,
    iterator: &str,
    body: &[String],
    break_condition: Option<&str>,
) -> Result<Option<Value>> {
    let value = template::evaluate_value(collection, ctx, &rt.eval_options())?;
    let Value::Array(items) = value else {
        return Err(Error::Expression(format!(
            "loop collection must evaluate to an array, got {}",
            collection
        )));
    };

    let mut iterations = 0usize;
    for item in items {
        if rt.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let child = ctx.child_scope();
        child.declare(iterator, item);

        if let Some(cond) = break_condition {
            if expr::evaluate_condition(cond, &child)? {
                break;
            }
        }

        for body_id in body {
            let node = rt
                .workflow
                .node(body_id)
                .ok_or_else(|| Error::Internal(format!("unknown loop body node: {}", body_id)))?;
            run_node(rt, node, &child).await?;
        }
        iterations += 1;
        // Child scope drops here; iteration-local names do not leak.
    }

    debug!(iterations, "loop finished");
    Ok(None)
}

/// Launch every branch concurrently in an isolated child scope and merge
/// per the configured strategy. Losing branches are cancelled on a
/// best-effort basis through a child token, then drained so no branch
/// outlives the parallel node.
async fn execute_parallel(
    rt: &ExecutionRuntime,
    ctx: &VariableContext,
    branches: &[Vec<String>],
    merge: MergeStrategy,
) -> Result<Option<Value>> {
    let branch_cancel = rt.cancel.child_token();
    let mut handles = Vec::with_capacity(branches.len());

    for branch in branches {
        let branch_rt = rt.with_cancel(branch_cancel.clone());
        let branch_ctx = ctx.child_scope();
        let node_ids = branch.clone();
        handles.push(tokio::spawn(async move {
            run_branch(branch_rt, node_ids, branch_ctx).await
        }));
    }

    match merge {
        MergeStrategy::WaitAll => {
            let mut first_error = None;
            for joined in join_all(handles).await {
                match flatten_join(joined) {
                    Ok(()) => {},
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(_) => {},
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(None),
            }
        },

        MergeStrategy::WaitAny => {
            let mut remaining = handles;
            let mut last_error = None;
            while !remaining.is_empty() {
                let (joined, _, rest) = select_all(remaining).await;
                remaining = rest;
                match flatten_join(joined) {
                    Ok(()) => {
                        branch_cancel.cancel();
                        drain(remaining).await;
                        return Ok(None);
                    },
                    Err(e) => last_error = Some(e),
                }
            }
            Err(last_error
                .unwrap_or_else(|| Error::Internal("parallel node has no branches".to_string())))
        },

        MergeStrategy::WaitFirst => {
            let (joined, _, remaining) = select_all(handles).await;
            branch_cancel.cancel();
            drain(remaining).await;
            flatten_join(joined)?;
            Ok(None)
        },
    }
}

async fn run_branch(
    rt: ExecutionRuntime,
    node_ids: Vec<String>,
    ctx: VariableContext,
) -> Result<()> {
    for node_id in &node_ids {
        let node = rt
            .workflow
            .node(node_id)
            .ok_or_else(|| Error::Internal(format!("unknown branch node: {}", node_id)))?;
        run_node(&rt, node, &ctx).await?;
    }
    Ok(())
}

/// Await cancelled losers so their records settle before the parallel
/// node reports completion.
async fn drain(handles: Vec<tokio::task::JoinHandle<Result<()>>>) {
    for joined in join_all(handles).await {
        if let Err(e) = flatten_join(joined) {
            debug!("drained branch ended with: {}", e);
        }
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Internal(format!("branch task panicked: {}", e))),
        Err(_) => Err(Error::Cancelled),
    }
}
