//! Execution records and live progress tracking

use crate::engine::context::VariableContext;
use crate::engine::events::{EventBus, EventFilter, EventStream};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Record of one node run. Loop iterations produce one record each.
#[derive(Debug, Clone, Serialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Variables visible when the node started.
    pub input_snapshot: serde_json::Map<String, Value>,
    pub output: Option<Value>,
}

/// Completed view of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeExecution>,
    pub error: Option<String>,
    pub return_value: Option<Value>,
    /// Root-scope variables at the end of the run.
    pub variables: serde_json::Map<String, Value>,
}

impl Execution {
    pub fn node_executions(&self, node_id: &str) -> Vec<&NodeExecution> {
        self.nodes.iter().filter(|n| n.node_id == node_id).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub percent_complete: f64,
}

/// Live, shared state of a running execution.
pub(crate) struct ExecutionState {
    pub id: Uuid,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub total_nodes: usize,
    status: RwLock<ExecutionStatus>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    nodes: RwLock<Vec<NodeExecution>>,
    error: RwLock<Option<String>>,
    return_value: RwLock<Option<Value>>,
}

impl ExecutionState {
    pub fn new(workflow_name: String, total_nodes: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name,
            started_at: Utc::now(),
            total_nodes,
            status: RwLock::new(ExecutionStatus::Running),
            completed_at: RwLock::new(None),
            nodes: RwLock::new(Vec::new()),
            error: RwLock::new(None),
            return_value: RwLock::new(None),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    /// First terminal transition wins; later attempts are ignored. This
    /// is what decides the cancellation-vs-completion race.
    pub fn try_finish(&self, status: ExecutionStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.write();
        if current.is_terminal() {
            return false;
        }
        *current = status;
        *self.completed_at.write() = Some(Utc::now());
        if let Some(message) = error {
            *self.error.write() = Some(message);
        }
        true
    }

    pub fn set_return_value(&self, value: Value) {
        *self.return_value.write() = Some(value);
    }

    /// Append a Running record; returns its index for later completion.
    pub fn begin_node(
        &self,
        node_id: &str,
        input_snapshot: serde_json::Map<String, Value>,
    ) -> usize {
        let mut nodes = self.nodes.write();
        nodes.push(NodeExecution {
            node_id: node_id.to_string(),
            status: NodeStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            input_snapshot,
            output: None,
        });
        nodes.len() - 1
    }

    pub fn complete_node(&self, index: usize, output: Option<Value>) {
        let mut nodes = self.nodes.write();
        if let Some(record) = nodes.get_mut(index) {
            record.status = NodeStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.output = output;
        }
    }

    pub fn fail_node(&self, index: usize, error: &str) {
        let mut nodes = self.nodes.write();
        if let Some(record) = nodes.get_mut(index) {
            record.status = NodeStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.error = Some(error.to_string());
        }
    }

    pub fn progress(&self) -> Progress {
        let nodes = self.nodes.read();
        let completed = nodes.iter().filter(|n| n.status == NodeStatus::Completed).count();
        let failed = nodes.iter().filter(|n| n.status == NodeStatus::Failed).count();
        let percent = if self.total_nodes == 0 {
            0.0
        } else {
            (completed as f64 / self.total_nodes as f64) * 100.0
        };
        Progress {
            total_nodes: self.total_nodes,
            completed_nodes: completed,
            failed_nodes: failed,
            percent_complete: percent,
        }
    }

    /// Copy out the full record.
    pub fn to_execution(&self, variables: serde_json::Map<String, Value>) -> Execution {
        Execution {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            status: *self.status.read(),
            started_at: self.started_at,
            completed_at: *self.completed_at.read(),
            nodes: self.nodes.read().clone(),
            error: self.error.read().clone(),
            return_value: self.return_value.read().clone(),
            variables,
        }
    }
}

/// Handle for observing a running execution: event subscription,
/// progress, and a root-scope variable snapshot.
#[derive(Clone)]
pub struct ExecutionMonitor {
    pub(crate) state: Arc<ExecutionState>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) root: VariableContext,
}

impl ExecutionMonitor {
    pub fn execution_id(&self) -> Uuid {
        self.state.id
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventStream {
        self.bus.subscribe_filtered(filter)
    }

    pub fn unsubscribe(&self, stream: &EventStream) {
        self.bus.unsubscribe(stream)
    }

    pub fn get_progress(&self) -> Progress {
        self.state.progress()
    }

    pub fn get_variable_snapshot(&self) -> serde_json::Map<String, Value> {
        self.root.snapshot()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terminal_transition_wins() {
        let state = ExecutionState::new("wf".into(), 3);
        assert!(state.try_finish(ExecutionStatus::Completed, None));
        assert!(!state.try_finish(ExecutionStatus::Cancelled, None));
        assert_eq!(state.status(), ExecutionStatus::Completed);
    }

    #[test]
    fn progress_counts_completed_and_failed() {
        let state = ExecutionState::new("wf".into(), 4);
        let a = state.begin_node("a", Default::default());
        state.complete_node(a, None);
        let b = state.begin_node("b", Default::default());
        state.fail_node(b, "boom");

        let progress = state.progress();
        assert_eq!(progress.completed_nodes, 1);
        assert_eq!(progress.failed_nodes, 1);
        assert_eq!(progress.total_nodes, 4);
        assert!((progress.percent_complete - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn node_timestamps_are_ordered() {
        let state = ExecutionState::new("wf".into(), 1);
        let idx = state.begin_node("a", Default::default());
        state.complete_node(idx, Some(serde_json::json!(1)));

        let execution = state.to_execution(Default::default());
        let record = &execution.nodes[0];
        assert!(record.started_at <= record.completed_at.unwrap());
        assert!(execution.started_at <= record.started_at);
    }
}
