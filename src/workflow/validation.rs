//! Structural validation of workflow graphs

use crate::error::{Error, Result};
use crate::expr::template::{condition_references, referenced_variables};
use crate::workflow::{NodeKind, TransportConfig, Workflow};
use std::collections::{HashMap, HashSet, VecDeque};
use url::Url;

/// Validate a workflow against the structural invariants.
///
/// Runs before any node executes; a workflow that passes is safe to hand
/// to the engine.
pub fn validate(workflow: &Workflow) -> Result<()> {
    if workflow.name.is_empty() {
        return Err(Error::Validation("Workflow name cannot be empty".to_string()));
    }

    let mut node_ids = HashSet::new();
    for node in &workflow.nodes {
        if node.id.is_empty() {
            return Err(Error::Validation("Node ID cannot be empty".to_string()));
        }
        if !node_ids.insert(node.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate node ID: {}", node.id)));
        }
    }

    let start_count = workflow
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .count();
    if start_count != 1 {
        return Err(Error::Validation(format!(
            "Workflow must have exactly one start node, found {}",
            start_count
        )));
    }

    if !workflow.nodes.iter().any(|n| matches!(n.kind, NodeKind::End { .. })) {
        return Err(Error::Validation(
            "Workflow must have at least one end node".to_string(),
        ));
    }

    validate_servers(workflow)?;
    validate_edges(workflow, &node_ids)?;
    validate_node_references(workflow, &node_ids)?;
    validate_variable_references(workflow)?;
    detect_cycles(workflow)?;

    Ok(())
}

fn validate_servers(workflow: &Workflow) -> Result<()> {
    let mut server_ids = HashSet::new();
    for server in &workflow.servers {
        if server.id.is_empty() {
            return Err(Error::Validation("Server ID cannot be empty".to_string()));
        }
        if !server_ids.insert(server.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate server ID: {}", server.id)));
        }
        match &server.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.is_empty() {
                    return Err(Error::Validation(format!(
                        "Server {} has an empty command",
                        server.id
                    )));
                }
            },
            TransportConfig::Sse { url, .. } | TransportConfig::Http { url, .. } => {
                Url::parse(url).map_err(|e| {
                    Error::Validation(format!("Server {} has an invalid URL: {}", server.id, e))
                })?;
            },
        }
    }
    Ok(())
}

fn validate_edges(workflow: &Workflow, node_ids: &HashSet<&str>) -> Result<()> {
    for edge in &workflow.edges {
        if !node_ids.contains(edge.from.as_str()) {
            return Err(Error::Validation(format!(
                "Edge references unknown node: {}",
                edge.from
            )));
        }
        if !node_ids.contains(edge.to.as_str()) {
            return Err(Error::Validation(format!(
                "Edge references unknown node: {}",
                edge.to
            )));
        }

        if let Some(cond) = &edge.condition {
            if cond != "true" && cond != "false" {
                return Err(Error::Validation(format!(
                    "Edge {} -> {} has invalid condition literal {:?} (expected \"true\" or \"false\")",
                    edge.from, edge.to, cond
                )));
            }
            let from_node = workflow.node(&edge.from);
            if !matches!(from_node.map(|n| &n.kind), Some(NodeKind::Condition { .. })) {
                return Err(Error::Validation(format!(
                    "Edge {} -> {} carries a condition but {} is not a condition node",
                    edge.from, edge.to, edge.from
                )));
            }
        }
    }
    Ok(())
}

/// Server references and loop/parallel body IDs must resolve.
fn validate_node_references(workflow: &Workflow, node_ids: &HashSet<&str>) -> Result<()> {
    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::McpTool { server, .. } => {
                if workflow.server(server).is_none() {
                    return Err(Error::Validation(format!(
                        "Node {} references undeclared server: {}",
                        node.id, server
                    )));
                }
            },
            NodeKind::Loop { body, iterator, .. } => {
                if iterator.is_empty() {
                    return Err(Error::Validation(format!(
                        "Loop node {} has an empty iterator name",
                        node.id
                    )));
                }
                if body.is_empty() {
                    return Err(Error::Validation(format!("Loop node {} has an empty body", node.id)));
                }
                for body_id in body {
                    if !node_ids.contains(body_id.as_str()) {
                        return Err(Error::Validation(format!(
                            "Loop node {} references unknown body node: {}",
                            node.id, body_id
                        )));
                    }
                }
            },
            NodeKind::Parallel { branches, .. } => {
                if branches.is_empty() {
                    return Err(Error::Validation(format!(
                        "Parallel node {} has no branches",
                        node.id
                    )));
                }
                for branch in branches {
                    for body_id in branch {
                        if !node_ids.contains(body_id.as_str()) {
                            return Err(Error::Validation(format!(
                                "Parallel node {} references unknown branch node: {}",
                                node.id, body_id
                            )));
                        }
                    }
                }
            },
            _ => {},
        }
    }
    Ok(())
}

/// Every `${...}` reference must resolve to a declared variable, a node
/// output, or a loop iterator in scope.
fn validate_variable_references(workflow: &Workflow) -> Result<()> {
    let mut known: HashSet<String> = workflow.variables.iter().map(|v| v.name.clone()).collect();
    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::McpTool { output, .. } | NodeKind::Transform { output, .. } => {
                known.insert(output.clone());
            },
            NodeKind::Loop { iterator, .. } => {
                known.insert(iterator.clone());
            },
            _ => {},
        }
    }

    for node in &workflow.nodes {
        let reject = |name: String| -> Result<()> {
            if known.contains(&name) {
                Ok(())
            } else {
                Err(Error::Validation(format!(
                    "Node {} references undeclared variable: {}",
                    node.id, name
                )))
            }
        };
        let check = |expr: &str| -> Result<()> {
            referenced_variables(expr).into_iter().try_for_each(&reject)
        };

        match &node.kind {
            NodeKind::End { return_expr: Some(expr) } => check(expr)?,
            NodeKind::McpTool { params, .. } => {
                for value in params.values() {
                    check(value)?;
                }
            },
            NodeKind::Transform { input, expression, .. } => {
                if !known.contains(input) {
                    return Err(Error::Validation(format!(
                        "Node {} reads undeclared input variable: {}",
                        node.id, input
                    )));
                }
                check(expression)?;
            },
            NodeKind::Loop { collection, break_condition, .. } => {
                check(collection)?;
                if let Some(cond) = break_condition {
                    condition_references(cond).into_iter().try_for_each(&reject)?;
                }
            },
            _ => {},
        }
    }
    Ok(())
}

/// Kahn's algorithm over the non-conditional edges. Conditional edges
/// define runtime branches and may legitimately point backwards.
fn detect_cycles(workflow: &Workflow) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in &workflow.edges {
        if edge.is_conditional() {
            continue;
        }
        successors.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &succ in successors.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(succ).expect("successor is a known node");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(succ);
            }
        }
    }

    if visited != workflow.nodes.len() {
        return Err(Error::Validation(
            "Workflow graph contains a cycle among non-conditional edges".to_string(),
        ));
    }
    Ok(())
}

/// Topological order of node IDs ignoring conditional edges.
///
/// Used by the engine after validation; ties are broken by declaration
/// order so scheduling is deterministic.
pub fn topological_order(workflow: &Workflow) -> Vec<String> {
    let order_index: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in &workflow.edges {
        if edge.is_conditional() {
            continue;
        }
        successors.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| order_index[id]);

    let mut order = Vec::with_capacity(workflow.nodes.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        order.push(id.to_string());
        for &succ in successors.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(succ).expect("successor is a known node");
            *degree -= 1;
            if *degree == 0 {
                let pos = ready
                    .binary_search_by_key(&order_index[succ], |r| order_index[r])
                    .unwrap_or_else(|p| p);
                ready.insert(pos, succ);
            }
        }
    }
    order
}
