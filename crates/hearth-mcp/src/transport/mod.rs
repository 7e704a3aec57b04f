//! MCP transport implementations.
//!
//! A transport delivers framed JSON-RPC messages to one server and correlates
//! responses with the requests that caused them. Two variants exist:
//!
//! - [`StdioTransport`] spawns a child process and speaks newline-delimited
//!   JSON over its standard streams.
//! - [`HttpTransport`] POSTs each message to an endpoint and keeps session
//!   affinity through the `Mcp-Session` header.
//!
//! Clients never build transports directly. They hold a [`Connect`]
//! implementation and ask it for a fresh transport on every (re)connect.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use hearth_core::config::{McpConfig, McpServerConfig, TransportKind};

use crate::context::CallContext;
use crate::error::{McpError, TransportError};
use crate::events::EventSink;
use crate::protocol::{Notification, Request, RequestId, Response};

mod http;
mod stdio;

#[cfg(test)]
pub(crate) mod fake;

pub use http::{HttpConnector, HttpTransport, MAX_REQUEST_BYTES, MAX_RESPONSE_BYTES, SESSION_HEADER};
pub use stdio::{StdioConnector, StdioTransport, READ_BUFFER_BYTES};

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its correlated response.
    ///
    /// A response carrying a JSON-RPC error is still a successful send.
    async fn send(&self, ctx: &CallContext, request: Request) -> Result<Response, TransportError>;

    /// Send a notification; nothing is awaited beyond the write.
    async fn notify(&self, ctx: &CallContext, notification: Notification) -> Result<(), TransportError>;

    /// Close the transport. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Creates transports for one configured server.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Establish a new connection whose server-pushed events go to `events`.
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>, TransportError>;

    /// Short description of the endpoint for logs.
    fn describe(&self) -> String;
}

/// Build the connector matching a server's configuration.
pub fn connector_for(server: &McpServerConfig, settings: &McpConfig) -> Result<Box<dyn Connect>, McpError> {
    match server.transport {
        TransportKind::Stdio => {
            let command = server.command.clone().ok_or_else(|| {
                McpError::InitializationFailed(format!("server '{}' has no command", server.name))
            })?;
            let mut connector = StdioConnector::new(&server.name, command)
                .with_args(server.args.clone())
                .with_response_timeout(settings.request_timeout())
                .with_grace(settings.shutdown_grace());
            for (key, value) in &server.env {
                connector = connector.with_env(key, value);
            }
            if let Some(dir) = &server.working_dir {
                connector = connector.with_working_dir(dir);
            }
            Ok(Box::new(connector))
        }
        TransportKind::Http => {
            let url = server.url.clone().ok_or_else(|| {
                McpError::InitializationFailed(format!("server '{}' has no url", server.name))
            })?;
            let connector = HttpConnector::new(url)
                .with_headers(server.headers.clone())
                .with_response_timeout(settings.request_timeout());
            Ok(Box::new(connector))
        }
    }
}

type Mailbox = oneshot::Sender<Result<Response, TransportError>>;

/// Outstanding requests keyed by ID, each with a single-slot mailbox.
///
/// Numeric and string IDs with the same text share a key, since servers may
/// echo `1` back as `"1"`.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    entries: HashMap<String, Mailbox>,
    closed: bool,
}

impl PendingTable {
    pub(crate) fn key(id: &RequestId) -> String {
        id.to_string()
    }

    /// Register a mailbox for `id`; fails once the table has been failed.
    pub(crate) fn register(
        &self,
        id: &RequestId,
    ) -> Result<oneshot::Receiver<Result<Response, TransportError>>, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(Self::key(id), tx);
        Ok(rx)
    }

    /// Deliver a response. Returns false when nobody is waiting for it.
    pub(crate) fn resolve(&self, response: Response) -> bool {
        let Some(id) = response.id.as_ref() else {
            return false;
        };
        let mailbox = self.inner.lock().entries.remove(&Self::key(id));
        match mailbox {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Fail every waiter with `ConnectionClosed` and refuse new entries.
    pub(crate) fn fail_all(&self) -> usize {
        let entries = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };
        let count = entries.len();
        for (_, tx) in entries {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Removes a pending entry when the waiting caller goes away, however it exits.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    key: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: &RequestId) -> Self {
        Self {
            table,
            key: PendingTable::key(id),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_matches_string_echo_of_numeric_id() {
        let table = PendingTable::default();
        let rx = table.register(&RequestId::Number(5)).unwrap();

        assert!(table.resolve(Response::success("5", json!({}))));
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.id, Some(RequestId::String("5".to_string())));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_spurious_response_is_rejected() {
        let table = PendingTable::default();
        assert!(!table.resolve(Response::success(9u64, json!({}))));

        let mut anonymous = Response::success(1u64, json!({}));
        anonymous.id = None;
        assert!(!table.resolve(anonymous));
    }

    #[tokio::test]
    async fn test_fail_all_signals_waiters_and_closes() {
        let table = PendingTable::default();
        let first = table.register(&RequestId::Number(1)).unwrap();
        let second = table.register(&RequestId::Number(2)).unwrap();

        assert_eq!(table.fail_all(), 2);
        assert!(matches!(first.await.unwrap(), Err(TransportError::ConnectionClosed)));
        assert!(matches!(second.await.unwrap(), Err(TransportError::ConnectionClosed)));
        assert!(matches!(
            table.register(&RequestId::Number(3)),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_guard_removes_entry() {
        let table = PendingTable::default();
        let id = RequestId::Number(1);
        let _rx = table.register(&id).unwrap();
        {
            let _guard = PendingGuard::new(&table, &id);
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_connector_for_requires_command() {
        let mut server = McpServerConfig::stdio("home", "ha-mcp");
        server.command = None;
        let result = connector_for(&server, &McpConfig::default());
        assert!(matches!(result, Err(McpError::InitializationFailed(_))));
    }

    #[test]
    fn test_connector_for_picks_transport() {
        let settings = McpConfig::default();
        let stdio = connector_for(&McpServerConfig::stdio("home", "ha-mcp"), &settings).unwrap();
        assert!(stdio.describe().contains("ha-mcp"));

        let http = connector_for(&McpServerConfig::http("remote", "http://localhost:8123/mcp"), &settings)
            .unwrap();
        assert_eq!(http.describe(), "http://localhost:8123/mcp");
    }
}
