//! MCP transport layer
//!
//! Three drivers speak the same JSON-RPC 2.0 contract over different
//! carriers:
//! - STDIO (spawned subprocess, line-delimited JSON)
//! - SSE (long-lived event stream for responses, POST for requests)
//! - HTTP (plain request/response)
//!
//! On connect each driver performs the MCP `initialize` exchange and
//! follows up with the `notifications/initialized` notification.

use crate::error::{Error, Result};
use crate::types::{McpResponse, ToolInfo, MCP_PROTOCOL_VERSION};
use crate::workflow::{ServerConfig, TransportConfig};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod codec;
pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Default deadline for `connect` when the caller has no opinion.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single `call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One process-wide reqwest client shared by the HTTP-based drivers;
/// cloning is cheap and reuses its connection pool.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);
    CLIENT.clone()
}

/// Common contract of all transport drivers.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the transport and perform the MCP initialization handshake.
    async fn connect(&self, deadline: Duration) -> Result<()>;

    /// Issue one request and await its correlated response result.
    async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value>;

    /// Fire a notification; no reply is expected.
    async fn notify(&self, method: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;

    async fn list_tools(&self, deadline: Duration) -> Result<Vec<ToolInfo>> {
        let result = self.call("tools/list", json!({}), deadline).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| Error::Protocol("tools/list result missing `tools`".to_string()))?;
        Ok(serde_json::from_value(tools)?)
    }

    async fn call_tool(&self, name: &str, arguments: Value, deadline: Duration) -> Result<Value> {
        self.call(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
            deadline,
        )
        .await
    }

    async fn ping(&self, deadline: Duration) -> Result<()> {
        self.call("ping", json!({}), deadline).await.map(|_| ())
    }
}

/// Shared `initialize` + `notifications/initialized` exchange, run by
/// every driver at the end of its `connect`.
pub(crate) async fn initialize_handshake(
    transport: &dyn McpTransport,
    deadline: Duration,
) -> Result<Value> {
    let params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcpflow",
            "version": env!("CARGO_PKG_VERSION"),
        }
    });

    let result = transport.call("initialize", params, deadline).await?;

    match result.get("protocolVersion").and_then(|v| v.as_str()) {
        Some(version) if version != MCP_PROTOCOL_VERSION => {
            warn!(server_version = version, "server speaks a different MCP protocol version");
        },
        Some(_) => {},
        None => {
            return Err(Error::Protocol(
                "initialize result missing protocolVersion".to_string(),
            ));
        },
    }

    if let Some(info) = result.get("serverInfo") {
        debug!(
            name = info.get("name").and_then(|n| n.as_str()).unwrap_or("unknown"),
            version = info.get("version").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "server initialized"
        );
    }

    transport.notify("notifications/initialized").await?;
    Ok(result)
}

/// Map a response awaited through a one-shot channel into a call result.
/// A closed channel means the transport went away mid-request.
pub(crate) async fn await_response(
    rx: tokio::sync::oneshot::Receiver<McpResponse>,
    tracker: &codec::RequestTracker,
    request_id: &str,
    deadline: Duration,
) -> Result<Value> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(response)) => codec::into_result(response),
        Ok(Err(_)) => Err(Error::Connect("transport closed before a reply arrived".to_string())),
        Err(_) => {
            tracker.forget(request_id);
            Err(Error::Timeout(deadline.as_millis() as u64))
        },
    }
}

/// Builds a transport driver for a server configuration.
pub trait TransportFactory: Send + Sync {
    fn create(&self, server: &ServerConfig) -> Arc<dyn McpTransport>;
}

/// Production factory: one driver per configured transport kind.
#[derive(Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, server: &ServerConfig) -> Arc<dyn McpTransport> {
        match &server.transport {
            TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::new(
                command.clone(),
                args.clone(),
                env.clone(),
            )),
            TransportConfig::Sse { url, headers } => {
                Arc::new(SseTransport::new(url.clone(), headers.clone()))
            },
            TransportConfig::Http { url, headers } => {
                Arc::new(HttpTransport::new(url.clone(), headers.clone()))
            },
        }
    }
}
