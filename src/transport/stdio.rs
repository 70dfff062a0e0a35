//! STDIO transport for local MCP servers
//!
//! Spawns the configured command with piped stdin/stdout/stderr. Requests
//! are written to stdin as line-delimited JSON; a dedicated reader task
//! parses stdout lines and routes responses through the correlation
//! table. Stderr is drained continuously so a chatty server cannot fill
//! its pipe buffer and wedge itself.

use crate::error::{Error, Result};
use crate::transport::codec::RequestTracker;
use crate::transport::{await_response, initialize_handshake, McpTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    tracker: Arc<RequestTracker>,
    session: Mutex<Option<StdioSession>>,
    connected: Arc<AtomicBool>,
}

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command,
            args,
            env,
            tracker: Arc::new(RequestTracker::new()),
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn spawn(&self) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Connect(format!("failed to spawn {}: {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connect("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connect("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Connect("child stderr unavailable".to_string()))?;

        let reader_task = tokio::spawn(Self::read_stdout(
            stdout,
            self.tracker.clone(),
            self.connected.clone(),
            self.command.clone(),
        ));
        let stderr_task = tokio::spawn(Self::drain_stderr(stderr, self.command.clone()));

        *self.session.lock().await = Some(StdioSession {
            child,
            stdin,
            reader_task,
            stderr_task,
        });
        self.connected.store(true, Ordering::SeqCst);

        info!(command = %self.command, "spawned stdio MCP server");
        Ok(())
    }

    /// Reader loop: route every JSON-RPC line, skip startup noise. EOF
    /// means the process went away; pending waiters see closed channels.
    async fn read_stdout(
        stdout: ChildStdout,
        tracker: Arc<RequestTracker>,
        connected: Arc<AtomicBool>,
        command: String,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if value.get("jsonrpc").is_some() => {
                    if value.get("result").is_some() || value.get("error").is_some() {
                        if let Err(e) = tracker.deliver(trimmed) {
                            error!(command = %command, "failed to route response: {}", e);
                        }
                    } else {
                        // Server-initiated request or notification.
                        debug!(command = %command, "ignoring server-initiated message");
                    }
                },
                _ => {
                    debug!(command = %command, "skipping non-JSON-RPC line");
                },
            }
        }
        debug!(command = %command, "stdio reader reached EOF");
        connected.store(false, Ordering::SeqCst);
        tracker.fail_all();
    }

    async fn drain_stderr(stderr: ChildStderr, command: String) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                debug!(command = %command, "stderr: {}", trimmed);
            }
        }
    }

    async fn write_line(&self, payload: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::Connect("stdio transport not connected".to_string()))?;
        session.stdin.write_all(payload.as_bytes()).await?;
        session.stdin.write_all(b"\n").await?;
        session.stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        self.spawn().await?;
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
        let (request, rx) = self.tracker.new_request(method, params);
        let id = request.id.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let payload = serde_json::to_string(&request)?;
        if let Err(e) = self.write_line(&payload).await {
            self.tracker.forget(&id);
            return Err(e);
        }

        await_response(rx, &self.tracker, &id, deadline).await
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = crate::types::McpRequest::notification(method);
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut session) = self.session.lock().await.take() {
            // Dropping stdin closes the pipe, giving the server a chance
            // to exit before the kill.
            drop(session.stdin);
            if let Err(e) = session.child.kill().await {
                debug!(command = %self.command, "kill after close: {}", e);
            }
            let _ = session.child.wait().await;
            session.reader_task.abort();
            session.stderr_task.abort();
        }

        self.tracker.fail_all();
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop on the Command covers the child; waiters must not
        // hang on a transport that is going away.
        self.tracker.fail_all();
    }
}
