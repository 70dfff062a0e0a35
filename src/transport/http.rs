//! HTTP transport
//!
//! The simplest driver: every request is a POST whose response body is
//! the JSON-RPC envelope, so correlation is trivial. The echoed ID is
//! still checked; a mismatch is a protocol error, not a silent accept.

use crate::error::{Error, Result};
use crate::transport::{initialize_handshake, McpTransport};
use crate::types::{McpRequest, McpResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            client: crate::transport::http_client(),
            connected: AtomicBool::new(false),
        }
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        builder
    }

    async fn post(&self, request: &McpRequest, deadline: Duration) -> Result<reqwest::Response> {
        let response = self
            .apply_headers(self.client.post(&self.url))
            .header("Content-Type", "application/json")
            .json(request)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(deadline.as_millis() as u64)
                } else {
                    Error::Connect(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!("HTTP {} from {}", status, self.url)));
        }
        Ok(response)
    }

    async fn round_trip(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = super::codec::next_request_id();
        let request = McpRequest::new(id.clone(), method, params);

        let response = self.post(&request, deadline).await?;
        let envelope: McpResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid JSON-RPC response body: {}", e)))?;

        match envelope.id_str() {
            Some(echoed) if echoed == id => {},
            other => {
                return Err(Error::Protocol(format!(
                    "response ID {:?} does not match request ID {}",
                    other, id
                )));
            },
        }

        super::codec::into_result(envelope)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        match tokio::time::timeout(deadline, initialize_handshake(self, deadline)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::SeqCst);
                // The handshake is connection setup: a protocol-shaped
                // failure here still means we never connected.
                Err(match e {
                    Error::Protocol(msg) => Error::Connect(msg),
                    other => other,
                })
            },
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::Timeout(deadline.as_millis() as u64))
            },
        }
    }

    async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Connect("HTTP transport not connected".to_string()));
        }
        self.round_trip(method, params, deadline).await
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = McpRequest::notification(method);
        self.post(&notification, crate::transport::DEFAULT_CALL_TIMEOUT).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
