//! SSE (Server-Sent Events) transport
//!
//! Keeps one long-lived GET open with `Accept: text/event-stream` and
//! reads responses off it; outgoing requests are POSTed to the same URL.
//! SSE framing: `data:` lines accumulate until a blank line dispatches
//! the event; multi-line data is joined with newlines; `event:`, `id:`,
//! `retry:`, and comment lines are ignored. Correlation works exactly as
//! for stdio, through the shared request tracker.

use crate::error::{Error, Result};
use crate::transport::codec::RequestTracker;
use crate::transport::{await_response, initialize_handshake, McpTransport};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    tracker: Arc<RequestTracker>,
    connected: Arc<AtomicBool>,
    stream_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            client: crate::transport::http_client(),
            tracker: Arc::new(RequestTracker::new()),
            connected: Arc::new(AtomicBool::new(false)),
            stream_task: parking_lot::Mutex::new(None),
        }
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        builder
    }

    async fn open_stream(&self, deadline: Duration) -> Result<()> {
        // The deadline bounds the header exchange only; the body is a
        // long-lived stream and must outlive it.
        let request = self
            .apply_headers(self.client.get(&self.url))
            .header("Accept", "text/event-stream");

        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| Error::Timeout(deadline.as_millis() as u64))?
            .map_err(|e| Error::Connect(format!("SSE stream open failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connect(format!(
                "SSE stream open returned HTTP {}",
                response.status()
            )));
        }

        let tracker = self.tracker.clone();
        let connected = self.connected.clone();
        let url = self.url.clone();

        let task = tokio::spawn(async move {
            let mut parser = SseEventParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for payload in parser.push(&bytes) {
                            if let Err(e) = tracker.deliver(&payload) {
                                warn!(url = %url, "undeliverable SSE event: {}", e);
                            }
                        }
                    },
                    Err(e) => {
                        debug!(url = %url, "SSE stream error: {}", e);
                        break;
                    },
                }
            }
            debug!(url = %url, "SSE stream ended");
            connected.store(false, Ordering::SeqCst);
            tracker.fail_all();
        });

        *self.stream_task.lock() = Some(task);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn post(&self, payload: &crate::types::McpRequest, deadline: Duration) -> Result<()> {
        let response = self
            .apply_headers(self.client.post(&self.url))
            .header("Content-Type", "application/json")
            .json(payload)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(deadline.as_millis() as u64)
                } else {
                    Error::Connect(format!("SSE POST failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "SSE POST returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        self.open_stream(deadline).await?;
        match tokio::time::timeout(deadline, initialize_handshake(self, deadline)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.close().await.ok();
                Err(e)
            },
            Err(_) => {
                self.close().await.ok();
                Err(Error::Timeout(deadline.as_millis() as u64))
            },
        }
    }

    async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Connect("SSE transport not connected".to_string()));
        }

        let (request, rx) = self.tracker.new_request(method, params);
        let id = request.id.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();

        if let Err(e) = self.post(&request, deadline).await {
            self.tracker.forget(&id);
            return Err(e);
        }

        await_response(rx, &self.tracker, &id, deadline).await
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = crate::types::McpRequest::notification(method);
        self.post(&notification, crate::transport::DEFAULT_CALL_TIMEOUT).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.stream_task.lock().take() {
            task.abort();
        }
        self.tracker.fail_all();
        Ok(())
    }
}

/// Incremental SSE frame parser. Feed it raw bytes; it yields the joined
/// `data:` payload of each completed event.
pub(crate) struct SseEventParser {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            data_lines: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }

            // Comment lines start with a colon.
            if line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // event:, id:, retry:, and unknown fields are ignored.
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b"event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events, vec!["{\"jsonrpc\":\"2.0\"}"]);
    }

    #[test]
    fn joins_multiline_data_with_newlines() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(events, vec!["{\"a\":\n1}"]);
    }

    #[test]
    fn ignores_comments_id_and_retry() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b": keepalive\nid: 42\nretry: 1000\ndata: x\n\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn handles_chunks_split_mid_line() {
        let mut parser = SseEventParser::new();
        assert!(parser.push(b"data: {\"jso").is_empty());
        assert!(parser.push(b"nrpc\":\"2.0\"}\n").is_empty());
        let events = parser.push(b"\n");
        assert_eq!(events, vec!["{\"jsonrpc\":\"2.0\"}"]);
    }

    #[test]
    fn handles_crlf_lines() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b"data: x\r\n\r\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b"data: a\n\ndata: b\n\n");
        assert_eq!(events, vec!["a", "b"]);
    }
}
