//! Stdio transport: a child process, JSON-RPC lines over stdin/stdout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::config::ToolServerConfig;
use crate::protocol::{RpcNotification, RpcRequest, RpcResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("timed out waiting for tool server response")]
    Timeout,
}

/// Non-JSON stdout lines tolerated before the server is declared broken
/// (catches servers that log to stdout instead of stderr).
const MAX_SKIP_LINES: usize = 1000;

/// One child process connection.
///
/// Whole request/response cycles are serialized behind `cycle_lock`; MCP
/// servers answer in order on a single pipe, so interleaving two callers
/// would cross their responses.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    cycle_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    pub fn spawn(config: &ToolServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let broken_pipe = || {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child pipe",
            ))
        };
        let stdin = child.stdin.take().ok_or_else(broken_pipe)?;
        let stdout = child.stdout.take().ok_or_else(broken_pipe)?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            cycle_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON line, skipping blank lines and stray log output.
    async fn read_json_line(&self) -> Result<String, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            if stdout.read_line(&mut line).await? == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tool server wrote too many non-JSON lines to stdout",
                )));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON tool server output");
        }
    }

    /// Send a request and wait for its matching response, bounded by `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<RpcResponse, TransportError> {
        let _cycle = self.cycle_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&RpcRequest::new(id, method, params))?;
        tracing::debug!(id, method, "tool server request");
        self.write_line(&json).await?;

        // Servers may interleave notifications; skip anything that isn't the
        // response to this id.
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let line = self.read_json_line().await?;
                if let Ok(resp) = serde_json::from_str::<RpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
                tracing::debug!(line = %line, "skipping unmatched tool server message");
            }
        })
        .await;

        match waited {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&RpcNotification::new(method))?;
        self.write_line(&json).await
    }

    /// Close stdin, give the process a grace period, then kill it.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "tool server exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for tool server"),
            Err(_) => {
                tracing::warn!("tool server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}
