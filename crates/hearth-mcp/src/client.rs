//! MCP client implementation.
//!
//! `McpClient` drives one server through the protocol state machine:
//! handshake, tool discovery with caching, tool calls, subscriptions and
//! host-driven reconnection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hearth_core::config::{Config, McpServerConfig};

use crate::context::CallContext;
use crate::error::{McpError, TransportError};
use crate::events::{Event, EventSink, DEFAULT_EVENT_CAPACITY};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, McpToolDefinition, Notification, Request, ServerCapabilities, SubscribeParams,
    MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_SUBSCRIBE_EVENTS,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::transport::{connector_for, Connect, Transport};

/// Connection state for an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection.
    Disconnected,
    /// Transport is being established.
    Connecting,
    /// Handshake in progress.
    Initializing,
    /// Handshake complete; requests are admitted.
    Ready,
    /// Closed for good.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What the server told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerIdentity {
    pub name: String,
    pub version: Option<String>,
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
}

struct Connection {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped on every new transport so stale results are not cached.
    generation: u64,
}

/// A client for a single MCP server.
pub struct McpClient {
    /// Server label.
    name: String,
    connector: Box<dyn Connect>,
    client_info: ClientInfo,
    conn: RwLock<Connection>,
    server: RwLock<Option<ServerIdentity>>,
    cached_tools: RwLock<Option<Vec<McpToolDefinition>>>,
    /// Acknowledged subscriptions in the order they were made.
    subscriptions: Mutex<Vec<String>>,
    /// Request ID counter; never reset.
    request_counter: AtomicU64,
    events: EventSink,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    /// Serializes initialize and reconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl McpClient {
    /// Create a disconnected client that connects through `connector`.
    pub fn new(name: impl Into<String>, connector: Box<dyn Connect>) -> Self {
        let (events, event_rx) = EventSink::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            name: name.into(),
            connector,
            client_info: ClientInfo::default(),
            conn: RwLock::new(Connection {
                state: ConnectionState::Disconnected,
                transport: None,
                generation: 0,
            }),
            server: RwLock::new(None),
            cached_tools: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            request_counter: AtomicU64::new(1),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a client for a configured server.
    pub fn from_config(server: &McpServerConfig, config: &Config) -> Result<Self, McpError> {
        let connector = connector_for(server, &config.mcp)?;
        Ok(Self::new(&server.name, connector).configured(config))
    }

    /// Apply the client identity and event buffer from configuration.
    pub fn configured(self, config: &Config) -> Self {
        self.with_client_info(ClientInfo::new(
            &config.general.client_name,
            &config.general.client_version,
        ))
        .with_event_capacity(config.mcp.event_buffer)
    }

    /// Identity sent in the `initialize` request.
    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    /// Capacity of the event channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, event_rx) = EventSink::channel(capacity);
        self.events = events;
        self.event_rx = Mutex::new(Some(event_rx));
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.read().state
    }

    /// Check if the client admits requests.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Server identity captured by the last successful handshake.
    pub fn server_info(&self) -> Option<ServerIdentity> {
        self.server.read().clone()
    }

    /// The cached tool list, if discovery has run on this connection.
    pub fn cached_tools(&self) -> Option<Vec<McpToolDefinition>> {
        self.cached_tools.read().clone()
    }

    /// Acknowledged subscriptions, oldest first.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Take the receiving end of the event channel. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.lock().take()
    }

    /// Events dropped because the channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Connect and perform the handshake. A ready client is left alone.
    pub async fn initialize(&self, ctx: &CallContext) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Closed => Err(McpError::Closed(self.name.clone())),
            _ => self.handshake(ctx).await,
        }
    }

    /// Tear down the current connection, handshake again and restore
    /// subscriptions.
    ///
    /// Subscriptions the server does not acknowledge this time are dropped
    /// from the set.
    pub async fn reconnect(&self, ctx: &CallContext) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(McpError::Closed(self.name.clone()));
        }

        info!(server = %self.name, "Reconnecting to MCP server");
        self.handshake(ctx).await?;

        let previous = std::mem::take(&mut *self.subscriptions.lock());
        let mut restored = 0;
        for event_type in &previous {
            match self.subscribe(ctx, event_type).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(
                    server = %self.name,
                    event_type = %event_type,
                    error = %e,
                    "Failed to restore subscription"
                ),
            }
        }

        info!(
            server = %self.name,
            restored = restored,
            total = previous.len(),
            "MCP server reconnected"
        );
        Ok(())
    }

    /// List the server's tools, from cache when discovery already ran.
    pub async fn list_tools(&self, ctx: &CallContext) -> Result<Vec<McpToolDefinition>, McpError> {
        let (transport, generation) = self.ready_transport()?;

        if let Some(tools) = self.cached_tools.read().clone() {
            return Ok(tools);
        }

        debug!(server = %self.name, "Listing tools");

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let params = cursor.take().map(|cursor| ListToolsParams { cursor: Some(cursor) });
            let page: ListToolsResult = self
                .call(ctx, &transport, generation, METHOD_TOOLS_LIST, params)
                .await?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(McpError::protocol(format!("tools/list repeated cursor '{}'", next)));
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        if self.conn.read().generation == generation {
            *self.cached_tools.write() = Some(tools.clone());
        }

        debug!(server = %self.name, tool_count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// Call a tool and flatten its content into one string.
    ///
    /// A result flagged `isError` becomes [`McpError::Tool`].
    pub async fn call_tool(&self, ctx: &CallContext, name: &str, arguments: Value) -> Result<String, McpError> {
        let result = self.call_tool_raw(ctx, name, arguments).await?;
        let text = result.flatten();

        if result.is_error {
            warn!(server = %self.name, tool = name, "Tool returned error");
            return Err(McpError::Tool {
                server: self.name.clone(),
                tool: name.to_string(),
                message: text,
            });
        }

        Ok(text)
    }

    /// Call a tool and return its unflattened result, error flag included.
    pub async fn call_tool_raw(
        &self,
        ctx: &CallContext,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let (transport, generation) = self.ready_transport()?;

        debug!(server = %self.name, tool = name, "Calling tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.call(ctx, &transport, generation, METHOD_TOOLS_CALL, Some(params))
            .await
    }

    /// Check liveness; any successful response counts.
    pub async fn ping(&self, ctx: &CallContext) -> Result<(), McpError> {
        let (transport, generation) = self.ready_transport()?;
        let _: Value = self
            .call(ctx, &transport, generation, METHOD_PING, None::<()>)
            .await?;
        Ok(())
    }

    /// Ask the server to emit events of `event_type`.
    pub async fn subscribe(&self, ctx: &CallContext, event_type: &str) -> Result<(), McpError> {
        let (transport, generation) = self.ready_transport()?;

        let params = SubscribeParams {
            event_type: event_type.to_string(),
        };
        let _: Value = self
            .call(ctx, &transport, generation, METHOD_SUBSCRIBE_EVENTS, Some(params))
            .await?;

        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|s| s == event_type) {
            subscriptions.push(event_type.to_string());
        }
        debug!(server = %self.name, event_type = event_type, "Subscribed to events");
        Ok(())
    }

    /// Close the client. It cannot be used afterwards.
    pub async fn close(&self) -> Result<(), McpError> {
        let transport = {
            let mut conn = self.conn.write();
            if conn.state == ConnectionState::Closed {
                return Ok(());
            }
            conn.state = ConnectionState::Closed;
            conn.transport.take()
        };
        self.cached_tools.write().take();

        debug!(server = %self.name, "Closing MCP connection");

        if let Some(transport) = transport {
            transport
                .close()
                .await
                .map_err(|e| McpError::transport("close", e))?;
        }

        info!(server = %self.name, "MCP connection closed");
        Ok(())
    }

    /// Generate a new request ID.
    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn ready_transport(&self) -> Result<(Arc<dyn Transport>, u64), McpError> {
        let conn = self.conn.read();
        match (&conn.state, &conn.transport) {
            (ConnectionState::Ready, Some(transport)) => Ok((Arc::clone(transport), conn.generation)),
            (ConnectionState::Closed, _) => Err(McpError::Closed(self.name.clone())),
            (state, _) => Err(McpError::NotReady {
                server: self.name.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Move to `state` unless the client has been closed.
    fn transition(&self, state: ConnectionState) -> bool {
        let mut conn = self.conn.write();
        if conn.state == ConnectionState::Closed {
            return false;
        }
        conn.state = state;
        true
    }

    fn closed(&self) -> McpError {
        McpError::Closed(self.name.clone())
    }

    /// Replace the transport and run the handshake. Caller holds `lifecycle`.
    async fn handshake(&self, ctx: &CallContext) -> Result<(), McpError> {
        let previous = {
            let mut conn = self.conn.write();
            if conn.state == ConnectionState::Closed {
                return Err(self.closed());
            }
            conn.state = ConnectionState::Connecting;
            conn.transport.take()
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(server = %self.name, error = %e, "Error closing previous transport");
            }
        }
        self.cached_tools.write().take();
        self.server.write().take();

        debug!(server = %self.name, endpoint = %self.connector.describe(), "Connecting to MCP server");

        let transport = match self.connector.connect(self.events.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(McpError::transport(METHOD_INITIALIZE, e));
            }
        };

        let generation = {
            let mut conn = self.conn.write();
            if conn.state == ConnectionState::Closed {
                None
            } else {
                conn.state = ConnectionState::Initializing;
                conn.transport = Some(Arc::clone(&transport));
                conn.generation += 1;
                Some(conn.generation)
            }
        };
        let Some(generation) = generation else {
            let _ = transport.close().await;
            return Err(self.closed());
        };

        match self.exchange_initialize(ctx, &transport, generation).await {
            Ok(identity) => {
                if !self.transition(ConnectionState::Ready) {
                    return Err(self.closed());
                }
                info!(
                    server = %self.name,
                    server_name = %identity.name,
                    protocol_version = %identity.protocol_version,
                    "MCP connection initialized"
                );
                *self.server.write() = Some(identity);
                Ok(())
            }
            Err(e) => {
                {
                    let mut conn = self.conn.write();
                    if conn.state != ConnectionState::Closed {
                        conn.state = ConnectionState::Disconnected;
                        conn.transport = None;
                    }
                }
                if let Err(close_err) = transport.close().await {
                    debug!(server = %self.name, error = %close_err, "Error closing failed transport");
                }
                warn!(server = %self.name, error = %e, "MCP handshake failed");
                Err(e)
            }
        }
    }

    async fn exchange_initialize(
        &self,
        ctx: &CallContext,
        transport: &Arc<dyn Transport>,
        generation: u64,
    ) -> Result<ServerIdentity, McpError> {
        let params = InitializeParams::new(self.client_info.clone());
        let result: InitializeResult = self
            .call(ctx, transport, generation, METHOD_INITIALIZE, Some(params))
            .await?;

        if result.protocol_version != MCP_PROTOCOL_VERSION {
            warn!(
                server = %self.name,
                advertised = %result.protocol_version,
                expected = MCP_PROTOCOL_VERSION,
                "Server speaks a different MCP protocol version"
            );
        }

        transport
            .notify(ctx, Notification::new(METHOD_INITIALIZED, None))
            .await
            .map_err(|e| self.transport_failure(generation, METHOD_INITIALIZED, e))?;

        Ok(ServerIdentity {
            name: result.server_info.name,
            version: result.server_info.version,
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
        })
    }

    /// Send a request and decode its result.
    async fn call<P, R>(
        &self,
        ctx: &CallContext,
        transport: &Arc<dyn Transport>,
        generation: u64,
        method: &str,
        params: Option<P>,
    ) -> Result<R, McpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let request = Request::new(self.next_request_id(), method, params);

        let response = transport
            .send(ctx, request)
            .await
            .map_err(|e| self.transport_failure(generation, method, e))?;

        let value = response.into_result().map_err(|error| McpError::Rpc {
            method: method.to_string(),
            error,
        })?;

        serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("invalid {} result: {}", method, e)))
    }

    /// Map a transport error, dropping to disconnected if the connection is gone.
    ///
    /// Failures from a transport of an earlier `generation` leave the current
    /// connection alone.
    fn transport_failure(&self, generation: u64, method: &str, err: TransportError) -> McpError {
        if err.is_connection_loss() {
            let mut conn = self.conn.write();
            if conn.generation != generation || conn.transport.is_none() {
                debug!(
                    server = %self.name,
                    method = method,
                    error = %err,
                    "Ignoring failure from a replaced transport"
                );
                return McpError::transport(method, err);
            }
            if conn.state != ConnectionState::Closed && conn.state != ConnectionState::Disconnected {
                warn!(server = %self.name, method = method, error = %err, "Lost connection to MCP server");
                conn.state = ConnectionState::Disconnected;
            }
            drop(conn);
            self.cached_tools.write().take();
        }
        McpError::transport(method, err)
    }
}
