//! Common test utilities: mock transports and workflow builders

// Not every test binary exercises every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use mcpflow::error::{Error, Result};
use mcpflow::transport::{McpTransport, TransportFactory};
use mcpflow::workflow::{ServerConfig, TransportConfig, Workflow};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable in-memory transport.
pub struct MockTransport {
    pub id: usize,
    connected: AtomicBool,
    fail_connect: bool,
    fail_ping: Arc<AtomicBool>,
    tool_response: Mutex<Option<Result<Value>>>,
    call_delay: Duration,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    fn new(id: usize, script: &MockScript) -> Self {
        Self {
            id,
            connected: AtomicBool::new(false),
            fail_connect: script.fail_connect,
            fail_ping: script.fail_ping.clone(),
            tool_response: Mutex::new(Some(script.tool_response())),
            call_delay: script.call_delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn connect(&self, _deadline: Duration) -> Result<()> {
        if self.fail_connect {
            return Err(Error::Connect("mock transport refused to connect".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn call(&self, method: &str, params: Value, _deadline: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Connect("mock transport not connected".to_string()));
        }
        self.calls.lock().push((method.to_string(), params));

        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }

        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "mock", "version": "0.0.0"}
            })),
            "ping" => {
                if self.fail_ping.load(Ordering::SeqCst) {
                    Err(Error::Server { code: -32000, message: "ping refused".to_string() })
                } else {
                    Ok(json!({}))
                }
            },
            "tools/list" => Ok(json!({"tools": [{"name": "echo"}]})),
            "tools/call" => {
                let mut slot = self.tool_response.lock();
                match slot.take() {
                    Some(response) => {
                        // Repeated calls keep yielding the scripted
                        // success; a scripted error fires once.
                        if let Ok(value) = &response {
                            *slot = Some(Ok(value.clone()));
                        }
                        response
                    },
                    None => Ok(json!({"content": []})),
                }
            },
            other => Err(Error::Server {
                code: -32601,
                message: format!("unknown method {}", other),
            }),
        }
    }

    async fn notify(&self, _method: &str) -> Result<()> {
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

/// What the next created transport should do.
#[derive(Clone)]
pub struct MockScript {
    pub fail_connect: bool,
    pub fail_ping: Arc<AtomicBool>,
    pub tool_value: Option<Value>,
    pub tool_error: Option<(i64, String)>,
    pub call_delay: Duration,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            fail_connect: false,
            fail_ping: Arc::new(AtomicBool::new(false)),
            tool_value: None,
            tool_error: None,
            call_delay: Duration::ZERO,
        }
    }
}

impl MockScript {
    fn tool_response(&self) -> Result<Value> {
        if let Some((code, message)) = &self.tool_error {
            return Err(Error::Server { code: *code, message: message.clone() });
        }
        Ok(self.tool_value.clone().unwrap_or_else(|| json!({"content": []})))
    }
}

/// Factory that hands out mock transports and remembers them.
pub struct MockFactory {
    script: Mutex<MockScript>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    next_id: AtomicUsize,
    /// Per-server overrides, applied by server ID.
    overrides: Mutex<std::collections::HashMap<String, MockScript>>,
}

impl MockFactory {
    pub fn new(script: MockScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            created: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            overrides: Mutex::new(Default::default()),
        })
    }

    pub fn with_default() -> Arc<Self> {
        Self::new(MockScript::default())
    }

    pub fn override_server(&self, server_id: &str, script: MockScript) {
        self.overrides.lock().insert(server_id.to_string(), script);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, server: &ServerConfig) -> Arc<dyn McpTransport> {
        let script = self
            .overrides
            .lock()
            .get(&server.id)
            .cloned()
            .unwrap_or_else(|| self.script.lock().clone());
        let transport = Arc::new(MockTransport::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            &script,
        ));
        self.created.lock().push(transport.clone());
        transport
    }
}

/// Minimal stdio-flavored server config; the mock factory ignores the
/// transport details.
pub fn server_config(id: &str) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: format!("Test Server {}", id),
        transport: TransportConfig::Stdio {
            command: "mock-server".to_string(),
            args: vec![],
            env: Default::default(),
        },
        credential_ref: None,
    }
}

#[allow(dead_code)]
pub fn load_workflow(yaml: &str) -> Workflow {
    Workflow::from_yaml(yaml).expect("test workflow must validate")
}
