//! JSON-RPC request framing and response correlation
//!
//! Request IDs are decimal strings from a process-wide monotonic counter.
//! String IDs keep correlation textual across transports, immune to the
//! numeric widening a decoder might apply. Each outstanding request is
//! paired with a one-shot channel; the transport's reader hands envelopes
//! to [`RequestTracker::deliver`], which completes the matching waiter.

use crate::error::{Error, Result};
use crate::types::{McpRequest, McpResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::warn;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-wide request ID as a decimal string.
pub fn next_request_id() -> String {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

type PendingSender = oneshot::Sender<McpResponse>;

/// Correlation table from request ID to waiting caller.
#[derive(Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<String, PendingSender>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request and register a waiter for its response. The
    /// waiter is registered before the request is sent, so a response
    /// racing the send cannot be lost.
    pub fn new_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> (McpRequest, oneshot::Receiver<McpResponse>) {
        let id = next_request_id();
        let request = McpRequest::new(id.clone(), method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (request, rx)
    }

    /// Parse one raw envelope and route it to its waiter. Server-initiated
    /// notifications (no ID) and unmatched IDs are logged and dropped.
    pub fn deliver(&self, raw: &str) -> Result<()> {
        let response: McpResponse = serde_json::from_str(raw)
            .map_err(|e| Error::Protocol(format!("malformed JSON-RPC envelope: {}", e)))?;
        self.deliver_response(response);
        Ok(())
    }

    /// Route an already-parsed envelope.
    pub fn deliver_response(&self, response: McpResponse) {
        let Some(id) = response.id_str() else {
            return;
        };

        let sender = self.pending.lock().remove(&id);
        match sender {
            // The waiter may have timed out and dropped its receiver.
            Some(tx) => {
                let _ = tx.send(response);
            },
            None => warn!(id = %id, "response without a matching pending request"),
        }
    }

    /// Discard a waiter, e.g. after a timeout.
    pub fn forget(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Drop every pending waiter. Receivers observe a closed channel,
    /// the documented signal for "transport went away".
    pub fn fail_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Turn a response envelope into its result, mapping JSON-RPC error
/// objects to [`Error::Server`].
pub fn into_result(response: McpResponse) -> Result<serde_json::Value> {
    if let Some(error) = response.error {
        return Err(Error::Server {
            code: error.code,
            message: error.message,
        });
    }
    response
        .result
        .ok_or_else(|| Error::Protocol("response carries neither result nor error".to_string()))
}
