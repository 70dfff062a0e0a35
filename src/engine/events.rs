//! Execution event bus
//!
//! Fan-out of execution events to any number of subscribers, each backed
//! by its own bounded channel. Publication never blocks on a subscriber:
//! when a subscriber's buffer is full, events are dropped for that
//! subscriber only. Within one subscriber, delivery order equals
//! publication order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Buffered events per subscriber before the drop policy kicks in.
const SUBSCRIBER_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    VariableChanged,
    ProgressUpdate,
}

impl EventKind {
    /// Terminal events close out an execution's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted
                | EventKind::ExecutionFailed
                | EventKind::ExecutionCancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionEvent {
    pub fn new(kind: EventKind, execution_id: Uuid) -> Self {
        Self {
            kind,
            execution_id,
            node_id: None,
            timestamp: Utc::now(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Subscriber-side filter on event kind and/or node ID.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<Vec<EventKind>>,
    pub node_id: Option<String>,
}

impl EventFilter {
    pub fn for_kinds(kinds: Vec<EventKind>) -> Self {
        Self { kinds: Some(kinds), node_id: None }
    }

    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self { kinds: None, node_id: Some(node_id.into()) }
    }

    fn matches(&self, event: &ExecutionEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if event.node_id.as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    id: Uuid,
    filter: Option<EventFilter>,
    tx: mpsc::Sender<ExecutionEvent>,
}

/// One bus per execution.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    dropped_events: std::sync::atomic::AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            dropped_events: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        self.attach(None)
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventStream {
        self.attach(Some(filter))
    }

    fn attach(&self, filter: Option<EventFilter>) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers.lock().push(Subscriber { id, filter, tx });
        EventStream { id, rx }
    }

    pub fn unsubscribe(&self, stream: &EventStream) {
        self.subscribers.lock().retain(|s| s.id != stream.id);
    }

    /// Deliver an event to every matching subscriber. Never blocks: a
    /// full buffer drops the event for that subscriber, a closed
    /// receiver removes the subscriber.
    pub fn publish(&self, event: ExecutionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter.matches(&event) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    debug!(subscriber = %sub.id, kind = ?event.kind, "subscriber buffer full, dropping event");
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Events dropped due to full subscriber buffers since creation.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of a subscription.
pub struct EventStream {
    id: Uuid,
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }
}
