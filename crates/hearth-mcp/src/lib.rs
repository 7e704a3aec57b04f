//! # hearth-mcp
//!
//! Model Context Protocol (MCP) client runtime for Hearth.
//!
//! This crate lets a host talk to external MCP servers and use their tools
//! as if they were its own.
//!
//! ## Overview
//!
//! - [`protocol`]: JSON-RPC 2.0 messages, the decoder and the MCP payloads
//! - [`transport`]: stdio (child process) and HTTP transports
//! - [`client`]: per-server state machine with handshake, tool discovery,
//!   tool calls, event subscriptions and reconnection
//! - [`bridge`]: merges every server's tools into one namespaced registry
//! - [`discovery`]: manages the configured servers and supervises them
//!
//! ## Example
//!
//! ```rust,ignore
//! use hearth_core::Config;
//! use hearth_mcp::{CallContext, McpServerManager};
//!
//! let config = Config::load()?;
//! let manager = McpServerManager::new(&config);
//! let ctx = CallContext::new();
//! manager.start_all(&ctx).await;
//!
//! let registry = manager.registry();
//! let text = registry
//!     .invoke(ctx, "mcp_home_get_state", serde_json::json!({"entity_id": "light.kitchen"}))
//!     .await?;
//! ```

pub mod bridge;
pub mod client;
pub mod context;
pub mod discovery;
pub mod error;
pub mod events;
pub mod probe;
pub mod protocol;
pub mod transport;

pub use bridge::{bridge, namespace, sanitize, RegistryEntry, ToolRegistry, MCP_TOOL_PREFIX};
pub use client::{ConnectionState, McpClient, ServerIdentity};
pub use context::{CallContext, Done};
pub use discovery::{McpServerManager, ServerStatus, StartReport};
pub use error::{McpError, TransportError};
pub use events::{Event, EventSink, DEFAULT_EVENT_CAPACITY};
pub use probe::{ReadinessProbe, TcpProbe};
pub use protocol::{
    decode, CallToolResult, ContentBlock, Message, McpToolDefinition, Notification, Request, RequestId,
    Response, RpcError,
};
pub use transport::{connector_for, Connect, HttpConnector, HttpTransport, StdioConnector, StdioTransport, Transport};
