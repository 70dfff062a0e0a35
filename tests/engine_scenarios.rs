//! End-to-end engine scenarios over mock transports

mod common;

use common::{server_config, MockFactory, MockScript};
use mcpflow::engine::{Engine, EventKind, ExecutionStatus, NodeStatus};
use mcpflow::pool::{ConnectionPool, PoolConfig};
use mcpflow::workflow::Workflow;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn engine_without_servers() -> Engine {
    let pool = ConnectionPool::with_factory(PoolConfig::default(), MockFactory::with_default());
    Engine::new(pool)
}

fn engine_with_factory(factory: Arc<MockFactory>) -> (Engine, Arc<ConnectionPool>) {
    let pool = ConnectionPool::with_factory(PoolConfig::default(), factory);
    (Engine::new(pool.clone()), pool)
}

#[tokio::test]
async fn simple_chain_transforms_and_returns() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: simple-chain
variables:
  - name: greeting
    type: string
    default: hello
nodes:
  - id: start
    type: start
  - id: shout
    type: transform
    input: greeting
    expression: "${upper(greeting)}"
    output: x
  - id: finish
    type: end
    return: "${x}"
edges:
  - from: start
    to: shout
  - from: shout
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.return_value, Some(json!("HELLO")));
    assert_eq!(execution.variables.get("x"), Some(&json!("HELLO")));

    let order: Vec<&str> = execution.nodes.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(order, vec!["start", "shout", "finish"]);
    assert!(execution.nodes.iter().all(|n| n.status == NodeStatus::Completed));
}

#[tokio::test]
async fn condition_branching_takes_false_edge() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: branching
variables:
  - name: userRole
    type: string
    required: true
nodes:
  - id: start
    type: start
  - id: check
    type: condition
    expression: "userRole == \"admin\""
  - id: admin_path
    type: passthrough
  - id: user_path
    type: passthrough
  - id: finish
    type: end
edges:
  - from: start
    to: check
  - from: check
    to: admin_path
    condition: "true"
  - from: check
    to: user_path
    condition: "false"
  - from: admin_path
    to: finish
  - from: user_path
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let mut inputs = HashMap::new();
    inputs.insert("userRole".to_string(), json!("user"));
    let execution = engine.execute(workflow, inputs).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.node_executions("user_path").len(), 1);
    assert!(execution.node_executions("admin_path").is_empty());

    let check = &execution.node_executions("check")[0];
    assert_eq!(check.output, Some(json!(false)));
}

#[tokio::test]
async fn loop_with_break_runs_three_iterations() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: looping
variables:
  - name: items
    type: array
    default: [1, 2, 3, 4, 5]
nodes:
  - id: start
    type: start
  - id: each
    type: loop
    collection: "${items}"
    iterator: item
    body: [step]
    break_condition: "item > 3"
  - id: step
    type: passthrough
  - id: finish
    type: end
edges:
  - from: start
    to: each
  - from: each
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.node_executions("step").len(), 3);
    // The iteration variable must not leak into the root scope.
    assert!(!execution.variables.contains_key("item"));
}

#[tokio::test]
async fn parallel_wait_all_fails_when_one_branch_fails() {
    let factory = MockFactory::with_default();
    factory.override_server(
        "tools",
        MockScript {
            tool_error: Some((-32000, "tool exploded".to_string())),
            ..MockScript::default()
        },
    );
    let (engine, pool) = engine_with_factory(factory);
    pool.register(server_config("tools")).unwrap();

    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: parallel-failure
servers:
  - id: tools
    name: Tools
    transport: stdio
    command: mock-server
nodes:
  - id: start
    type: start
  - id: par
    type: parallel
    branches:
      - [branch_a]
      - [branch_b]
    merge: wait_all
  - id: branch_a
    type: transform
    input: seed
    expression: "ok"
    output: r
  - id: branch_b
    type: mcp_tool
    server: tools
    tool: explode
    output: tool_result
  - id: finish
    type: end
variables:
  - name: seed
    type: string
    default: s
edges:
  - from: start
    to: par
  - from: par
    to: finish
"#,
    )
    .unwrap();

    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let branch_a = execution.node_executions("branch_a");
    assert_eq!(branch_a.len(), 1);
    assert_eq!(branch_a[0].status, NodeStatus::Completed);

    let error = execution.error.as_deref().unwrap();
    assert!(error.contains("branch_b"), "error should reference the failing node: {error}");
    assert!(error.contains("tool exploded"), "error should carry the server message: {error}");
}

#[tokio::test]
async fn parallel_wait_any_succeeds_despite_failing_branch() {
    let factory = MockFactory::with_default();
    factory.override_server(
        "tools",
        MockScript {
            tool_error: Some((-32000, "tool exploded".to_string())),
            ..MockScript::default()
        },
    );
    let (engine, pool) = engine_with_factory(factory);
    pool.register(server_config("tools")).unwrap();

    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: parallel-any
servers:
  - id: tools
    name: Tools
    transport: stdio
    command: mock-server
variables:
  - name: seed
    type: string
    default: s
  - name: r
    type: string
    default: ""
nodes:
  - id: start
    type: start
  - id: par
    type: parallel
    branches:
      - [branch_ok]
      - [branch_bad]
    merge: wait_any
  - id: branch_ok
    type: transform
    input: seed
    expression: "fine"
    output: r
  - id: branch_bad
    type: mcp_tool
    server: tools
    tool: explode
    output: tool_result
  - id: finish
    type: end
    return: "${r}"
edges:
  - from: start
    to: par
  - from: par
    to: finish
"#,
    )
    .unwrap();

    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.return_value, Some(json!("fine")));
}

#[tokio::test]
async fn mcp_tool_writes_output_and_releases_connection() {
    let factory = MockFactory::with_default();
    factory.override_server(
        "tools",
        MockScript {
            tool_value: Some(json!({"content": [{"type": "text", "text": "4"}]})),
            ..MockScript::default()
        },
    );
    let (engine, pool) = engine_with_factory(factory.clone());
    pool.register(server_config("tools")).unwrap();

    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: tool-call
servers:
  - id: tools
    name: Tools
    transport: stdio
    command: mock-server
variables:
  - name: a
    type: number
    default: 2
nodes:
  - id: start
    type: start
  - id: add
    type: mcp_tool
    server: tools
    tool: adder
    params:
      x: "${a}"
      y: "2"
    output: sum
  - id: finish
    type: end
    return: "${sum}"
edges:
  - from: start
    to: add
  - from: add
    to: finish
"#,
    )
    .unwrap();

    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.variables.get("sum"),
        Some(&json!({"content": [{"type": "text", "text": "4"}]}))
    );

    // The tool call carried resolved, typed arguments.
    let transports = factory.created();
    assert_eq!(transports.len(), 1);
    let calls = transports[0].calls();
    let (method, params) = calls
        .iter()
        .find(|(m, _)| m == "tools/call")
        .expect("tools/call must have been issued");
    assert_eq!(method, "tools/call");
    assert_eq!(params["name"], json!("adder"));
    assert_eq!(params["arguments"]["x"], json!(2));

    // Released on success: the pool reports no active connections.
    let stats = pool.stats();
    assert_eq!(stats["tools"].active, 0);
}

#[tokio::test]
async fn events_bracket_the_run_in_order() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: eventful
variables:
  - name: s
    type: string
    default: v
nodes:
  - id: start
    type: start
  - id: mid
    type: transform
    input: s
    expression: "${s}"
    output: t
  - id: finish
    type: end
edges:
  - from: start
    to: mid
  - from: mid
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let handle = engine.start(workflow, HashMap::new()).unwrap();
    let mut stream = handle.monitor().subscribe();

    let execution = handle.run().await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let mut events = Vec::new();
    while let Some(event) = stream.try_recv() {
        events.push(event);
    }

    assert_eq!(events.first().unwrap().kind, EventKind::ExecutionStarted);
    assert_eq!(events.last().unwrap().kind, EventKind::ExecutionCompleted);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let node_starts: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::NodeStarted)
        .filter_map(|e| e.node_id.as_deref())
        .collect();
    assert_eq!(node_starts, vec!["start", "mid", "finish"]);
}

#[tokio::test]
async fn progress_reaches_completion() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: progressive
nodes:
  - id: start
    type: start
  - id: a
    type: passthrough
  - id: finish
    type: end
edges:
  - from: start
    to: a
  - from: a
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let handle = engine.start(workflow, HashMap::new()).unwrap();
    let monitor = handle.monitor().clone();
    let execution = handle.run().await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let progress = monitor.get_progress();
    assert_eq!(progress.total_nodes, 3);
    assert_eq!(progress.completed_nodes, 3);
    assert!((progress.percent_complete - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cancellation_mid_tool_call_yields_cancelled_status() {
    let factory = MockFactory::with_default();
    factory.override_server(
        "slow",
        MockScript {
            call_delay: Duration::from_millis(500),
            ..MockScript::default()
        },
    );
    let (engine, pool) = engine_with_factory(factory);
    pool.register(server_config("slow")).unwrap();

    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: cancellable
servers:
  - id: slow
    name: Slow
    transport: stdio
    command: mock-server
nodes:
  - id: start
    type: start
  - id: wait
    type: mcp_tool
    server: slow
    tool: sleepy
    output: r
  - id: finish
    type: end
edges:
  - from: start
    to: wait
  - from: wait
    to: finish
"#,
    )
    .unwrap();

    let engine = Arc::new(engine);
    let handle = engine.start(workflow, HashMap::new()).unwrap();

    let runner = tokio::spawn(handle.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel();

    let execution = runner.await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn fast_workflow_may_complete_despite_late_cancel() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: quick
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
    .unwrap();

    let engine = engine_without_servers();
    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();
    // Cancel after the terminal transition: the first transition wins.
    engine.cancel();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn loop_writes_to_outer_variable_survive() {
    let workflow = Workflow::from_yaml(
        r#"
version: "1.0"
name: accumulating
variables:
  - name: items
    type: array
    default: ["a", "b"]
  - name: last
    type: string
    default: ""
nodes:
  - id: start
    type: start
  - id: each
    type: loop
    collection: "${items}"
    iterator: item
    body: [copy]
  - id: copy
    type: transform
    input: item
    expression: "${item}"
    output: last
  - id: finish
    type: end
    return: "${last}"
edges:
  - from: start
    to: each
  - from: each
    to: finish
"#,
    )
    .unwrap();

    let engine = engine_without_servers();
    let execution = engine.execute(workflow, HashMap::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    // `last` is declared in the root scope, so body writes land there.
    assert_eq!(execution.return_value, Some(json!("b")));
    // `item` was bound per iteration and is gone.
    assert!(!execution.variables.contains_key("item"));
}
