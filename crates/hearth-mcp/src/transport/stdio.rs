//! Standard I/O transport.
//!
//! Spawns the server as a child process and exchanges newline-delimited JSON
//! over its stdin/stdout. A reader task owns stdout and dispatches every line;
//! stdin writes are serialized by a one-permit semaphore.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connect, PendingGuard, PendingTable, Transport};
use crate::context::CallContext;
use crate::error::TransportError;
use crate::events::{Event, EventSink};
use crate::protocol::{self, encode_line, Message, Notification, Request, Response, METHOD_EVENT};

/// Read buffer for the child's stdout. Lines may be longer; this only sizes
/// the initial allocation so large catalogs don't need many refills.
pub const READ_BUFFER_BYTES: usize = 1024 * 1024;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Connector that spawns a fresh child process per connection.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    label: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    response_timeout: Duration,
    grace: Duration,
}

impl StdioConnector {
    /// Create a connector for `command`; `label` tags logs and event origins.
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Upper bound on waiting for any single response.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// How long `close` waits after SIGTERM before killing the child.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Spawn the child and start its reader.
    pub async fn spawn(&self, events: EventSink) -> Result<StdioTransport, TransportError> {
        StdioTransport::spawn(self, events).await
    }
}

#[async_trait]
impl Connect for StdioConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.spawn(events).await?))
    }

    fn describe(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Standard I/O transport for MCP servers.
pub struct StdioTransport {
    label: String,
    /// The child process.
    child: Mutex<Child>,
    /// Stdin writer; `None` once closed.
    stdin: Mutex<Option<ChildStdin>>,
    /// Single write slot guarding stdin. Closed by `close`.
    write_slot: Semaphore,
    pending: Arc<PendingTable>,
    connected: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stderr: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pid: Option<u32>,
    response_timeout: Duration,
    grace: Duration,
}

impl StdioTransport {
    async fn spawn(connector: &StdioConnector, events: EventSink) -> Result<Self, TransportError> {
        debug!(
            server = %connector.label,
            command = %connector.command,
            args = ?connector.args,
            "Spawning MCP server process"
        );

        let mut cmd = Command::new(&connector.command);
        cmd.args(&connector.args)
            .envs(&connector.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &connector.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let pid = child.id();

        let pending = Arc::new(PendingTable::default());
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            stdout,
            Arc::clone(&pending),
            events,
            Arc::clone(&connected),
            connector.label.clone(),
        ));
        let stderr = tokio::spawn(drain_stderr(stderr, connector.label.clone()));

        info!(server = %connector.label, pid = ?pid, "MCP server process spawned");

        Ok(Self {
            label: connector.label.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            write_slot: Semaphore::new(1),
            pending,
            connected,
            reader: parking_lot::Mutex::new(Some(reader)),
            stderr: parking_lot::Mutex::new(Some(stderr)),
            pid,
            response_timeout: connector.response_timeout,
            grace: connector.grace,
        })
    }

    /// Get the process ID of the child process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of free write slots (0 while a write is in progress).
    pub fn free_write_slots(&self) -> usize {
        self.write_slot.available_permits()
    }

    /// Write one line while holding the write slot.
    async fn write(&self, ctx: &CallContext, line: &[u8]) -> Result<(), TransportError> {
        let permit = tokio::select! {
            biased;
            done = ctx.done() => return Err(done.into()),
            permit = self.write_slot.acquire() => permit.map_err(|_| TransportError::NotConnected)?,
        };
        // The permit may have been granted just as the context fired.
        if let Some(done) = ctx.err() {
            drop(permit);
            return Err(done.into());
        }

        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or(TransportError::NotConnected)?;
        let result = async {
            writer.write_all(line).await?;
            writer.flush().await
        }
        .await;
        drop(stdin);
        drop(permit);

        result.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::WriteError(e)
        })
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        let mut child = self.child.lock().await;

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                debug!(server = %self.label, pid = pid, "Sending SIGTERM to MCP server");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.label, status = %status, "MCP server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::TerminateFailed(e)),
            Err(_) => {
                warn!(server = %self.label, "MCP server did not exit gracefully, killing");
                child.kill().await.map_err(TransportError::TerminateFailed)
            }
        }
    }

    async fn join_tasks(&self) {
        let handles = [self.reader.lock().take(), self.stderr.lock().take()];
        for handle in handles.into_iter().flatten() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.grace, handle).await.is_err() {
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, ctx: &CallContext, request: Request) -> Result<Response, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let line = encode_line(&request).map_err(|e| TransportError::Encode(e.to_string()))?;

        // Registered before writing so a fast reply cannot miss its mailbox.
        let rx = self.pending.register(&request.id)?;
        let _guard = PendingGuard::new(&self.pending, &request.id);

        debug!(server = %self.label, id = %request.id, method = %request.method, "Sending request");
        self.write(ctx, &line).await?;

        tokio::select! {
            result = rx => result.unwrap_or(Err(TransportError::ConnectionClosed)),
            done = ctx.done() => Err(done.into()),
            _ = tokio::time::sleep(self.response_timeout) => {
                Err(TransportError::Timeout(self.response_timeout))
            }
        }
    }

    async fn notify(&self, ctx: &CallContext, notification: Notification) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let line = encode_line(&notification).map_err(|e| TransportError::Encode(e.to_string()))?;
        debug!(server = %self.label, method = %notification.method, "Sending notification");
        self.write(ctx, &line).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Waiting for the slot lets an in-flight write finish first.
        let Ok(permit) = self.write_slot.acquire().await else {
            return Ok(());
        };
        self.write_slot.close();
        drop(permit);

        debug!(server = %self.label, "Closing MCP server transport");
        self.connected.store(false, Ordering::SeqCst);

        // Closing stdin gives a well-behaved child EOF.
        drop(self.stdin.lock().await.take());

        let result = self.terminate().await;
        self.join_tasks().await;
        self.pending.fail_all();

        info!(server = %self.label, "MCP server transport closed");
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the tasks would otherwise idle on dead pipes.
        for handle in [self.reader.get_mut().take(), self.stderr.get_mut().take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn missing_pipe(name: &str) -> TransportError {
    TransportError::SpawnFailed(std::io::Error::other(format!("failed to capture {}", name)))
}

async fn read_loop(
    stdout: ChildStdout,
    pending: Arc<PendingTable>,
    events: EventSink,
    connected: Arc<AtomicBool>,
    label: String,
) {
    let mut lines = BufReader::with_capacity(READ_BUFFER_BYTES, stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(server = %label, "MCP server closed stdout");
                break;
            }
            Err(e) => {
                debug!(server = %label, error = %e, "Failed to read from MCP server");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match protocol::decode(line.as_bytes()) {
            Ok(Message::Response(response)) => {
                let id = response.id.clone();
                if !pending.resolve(response) {
                    debug!(server = %label, id = ?id, "Dropping response with no waiting request");
                }
            }
            Ok(Message::Notification(notification)) if notification.method == METHOD_EVENT => {
                match Event::from_params(notification.params, &label) {
                    Ok(event) => events.push(event),
                    Err(e) => debug!(server = %label, error = %e, "Ignoring malformed event"),
                }
            }
            Ok(other) => {
                debug!(server = %label, message = ?other, "Ignoring unexpected message");
            }
            Err(e) => {
                debug!(server = %label, error = %e, "Undecodable line from MCP server");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let failed = pending.fail_all();
    if failed > 0 {
        debug!(server = %label, failed = failed, "Failed outstanding requests");
    }
}

async fn drain_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %label, stderr = %line, "MCP server stderr");
    }
}
