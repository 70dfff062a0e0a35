//! Workflow graph data model
//!
//! Handles loading, validation, and credential-stripping export of
//! declarative workflow definitions. A [`Workflow`] is an immutable graph
//! of typed nodes and directed edges, plus the variable and server
//! declarations the nodes reference.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub mod export;
pub mod validation;

pub use export::export_sanitized;

/// A validated workflow graph.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workflow {
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Load a workflow from a YAML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Validation(format!("Failed to read workflow file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse a workflow from YAML text and validate it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(content)
            .map_err(|e| Error::Validation(format!("Failed to parse workflow YAML: {}", e)))?;
        validation::validate(&workflow)?;
        Ok(workflow)
    }

    /// Serialize the workflow back to YAML without any stripping.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// The unique entry node. Validation guarantees exactly one exists.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }
}

/// A declared workflow variable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl VariableType {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::Number => value.is_number(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Array => value.is_array(),
            VariableType::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Number => "number",
            VariableType::Boolean => "boolean",
            VariableType::Array => "array",
            VariableType::Object => "object",
        }
    }
}

/// A workflow node: an ID plus a kind-specific payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End {
        /// Optional return expression evaluated against the final context.
        #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
        return_expr: Option<String>,
    },
    /// Identity node used to smooth graph shapes.
    Passthrough,
    McpTool {
        server: String,
        tool: String,
        /// Parameter values are template expressions evaluated per call.
        #[serde(default)]
        params: HashMap<String, String>,
        output: String,
    },
    Transform {
        input: String,
        expression: String,
        output: String,
    },
    Condition {
        expression: String,
    },
    Loop {
        collection: String,
        iterator: String,
        body: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        break_condition: Option<String>,
    },
    Parallel {
        branches: Vec<Vec<String>>,
        #[serde(default)]
        merge: MergeStrategy,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End { .. } => "end",
            NodeKind::Passthrough => "passthrough",
            NodeKind::McpTool { .. } => "mcp_tool",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Parallel { .. } => "parallel",
        }
    }
}

/// How a parallel node decides it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Await every branch; fail if any branch fails.
    #[default]
    WaitAll,
    /// Complete on the first success; fail only if all branches fail.
    WaitAny,
    /// Complete on the first branch to return, success or failure.
    WaitFirst,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// `"true"` / `"false"` on outgoing edges of condition nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Conditional edges define runtime branches, not structural
    /// dependencies; the topological order ignores them.
    pub fn is_conditional(&self) -> bool {
        matches!(self.condition.as_deref(), Some("true") | Some("false"))
    }
}

/// Configuration for one MCP server referenced by mcp_tool nodes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::Http { .. } => "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN_YAML: &str = r#"
version: "1.0"
name: simple-chain
nodes:
  - id: start
    type: start
  - id: shout
    type: transform
    input: greeting
    expression: "${upper(greeting)}"
    output: shouted
  - id: finish
    type: end
    return: "${shouted}"
edges:
  - from: start
    to: shout
  - from: shout
    to: finish
variables:
  - name: greeting
    type: string
    default: hello
"#;

    #[test]
    fn parses_simple_chain() {
        let wf = Workflow::from_yaml(CHAIN_YAML).unwrap();
        assert_eq!(wf.name, "simple-chain");
        assert_eq!(wf.nodes.len(), 3);
        assert!(matches!(
            wf.node("shout").unwrap().kind,
            NodeKind::Transform { .. }
        ));
        match &wf.node("finish").unwrap().kind {
            NodeKind::End { return_expr } => {
                assert_eq!(return_expr.as_deref(), Some("${shouted}"));
            },
            other => panic!("expected end node, got {other:?}"),
        }
    }

    #[test]
    fn yaml_round_trips_structurally() {
        let wf = Workflow::from_yaml(CHAIN_YAML).unwrap();
        let again = Workflow::from_yaml(&wf.to_yaml().unwrap()).unwrap();
        assert_eq!(again.nodes.len(), wf.nodes.len());
        assert_eq!(again.edges.len(), wf.edges.len());
        assert_eq!(again.variables.len(), wf.variables.len());
    }

    #[test]
    fn parses_server_transports() {
        let yaml = r#"
version: "1.0"
name: servers
servers:
  - id: files
    name: Filesystem
    transport: stdio
    command: mcp-server-fs
    args: ["--root", "/tmp"]
  - id: web
    name: Web API
    transport: http
    url: http://localhost:9000/mcp
    credential_ref: web-api-token
nodes:
  - id: start
    type: start
  - id: finish
    type: end
edges:
  - from: start
    to: finish
"#;
        let wf = Workflow::from_yaml(yaml).unwrap();
        assert_eq!(wf.server("files").unwrap().transport.kind(), "stdio");
        assert_eq!(
            wf.server("web").unwrap().credential_ref.as_deref(),
            Some("web-api-token")
        );
    }

    #[test]
    fn conditional_edges_are_flagged() {
        let edge = Edge {
            from: "check".into(),
            to: "yes".into(),
            condition: Some("true".into()),
            label: None,
        };
        assert!(edge.is_conditional());

        let plain = Edge {
            from: "a".into(),
            to: "b".into(),
            condition: None,
            label: Some("next".into()),
        };
        assert!(!plain.is_conditional());
    }
}
