//! Tool bridge: merges every server's catalog into one host-visible registry.
//!
//! Each bridged tool is registered as `mcp_{server}_{tool}` (both parts
//! sanitized) and invoking it proxies a `tools/call` with the original tool
//! name back to the owning client.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use hearth_core::tool::{ToolCategory, ToolDefinition};
pub use hearth_core::tool::sanitize;

use crate::client::McpClient;
use crate::context::CallContext;
use crate::error::McpError;
use crate::protocol::McpToolDefinition;

/// Prefix for MCP tool names to avoid collisions with native tools.
pub const MCP_TOOL_PREFIX: &str = "mcp_";

/// Build the namespaced name for a server's tool.
pub fn namespace(server: &str, tool: &str) -> String {
    format!("{}{}_{}", MCP_TOOL_PREFIX, sanitize(server), sanitize(tool))
}

/// Proxy invoked with the caller's context and the tool arguments.
pub type InvokeFn = Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, Result<String, McpError>> + Send + Sync>;

/// One bridged tool.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Namespaced name.
    pub name: String,
    pub description: String,
    /// Input schema, forwarded verbatim.
    pub input_schema: Value,
    /// Label of the owning server.
    pub server: String,
    /// Tool name as the server knows it.
    pub original_name: String,
    invoke: InvokeFn,
}

impl RegistryEntry {
    /// Entry that proxies to `client` without keeping it alive.
    pub fn for_client(server: &str, tool: &McpToolDefinition, client: &Arc<McpClient>) -> Self {
        let client: Weak<McpClient> = Arc::downgrade(client);
        let label = server.to_string();
        let original = tool.name.clone();

        let invoke: InvokeFn = Arc::new(move |ctx: CallContext, args: Value| {
            let client = client.clone();
            let label = label.clone();
            let original = original.clone();
            async move {
                let client = client.upgrade().ok_or(McpError::ServerNotFound(label))?;
                client.call_tool(&ctx, &original, args).await
            }
            .boxed()
        });

        Self {
            name: namespace(server, &tool.name),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| format!("MCP tool from {}", server)),
            input_schema: tool.input_schema.clone(),
            server: server.to_string(),
            original_name: tool.name.clone(),
            invoke,
        }
    }

    /// Run the proxy.
    pub async fn invoke(&self, ctx: CallContext, args: Value) -> Result<String, McpError> {
        (self.invoke)(ctx, args).await
    }

    /// Host-visible definition of this tool.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description)
            .with_parameters(self.input_schema.clone())
            .with_category(ToolCategory::Mcp(self.server.clone()))
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("original_name", &self.original_name)
            .finish_non_exhaustive()
    }
}

/// Namespaced tool name to proxy. Holds metadata and closures only.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, returning the one it replaced.
    pub fn register(&self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.write().insert(entry.name.clone(), entry)
    }

    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Invoke a tool by its namespaced name.
    pub async fn invoke(&self, ctx: CallContext, name: &str, args: Value) -> Result<String, McpError> {
        let entry = self
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        debug!(tool = name, server = %entry.server, original = %entry.original_name, "Invoking bridged tool");
        entry.invoke(ctx, args).await
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.entries.read().values().map(RegistryEntry::definition).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// All namespaced names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries owned by `server`.
    pub fn count_for(&self, server: &str) -> usize {
        self.entries.read().values().filter(|e| e.server == server).count()
    }

    /// Drop every entry of one server, returning how many went.
    pub fn remove_server(&self, server: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.server != server);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Register a client's tools under `server`, honoring include/exclude.
///
/// `include`, when non-empty, lists the only tools taken; `exclude` then
/// removes tools from what is left. Both match the server-side names.
/// Returns the number of distinct names registered.
pub async fn bridge(
    registry: &ToolRegistry,
    client: &Arc<McpClient>,
    ctx: &CallContext,
    server: &str,
    include: &[String],
    exclude: &[String],
) -> Result<usize, McpError> {
    let tools = client.list_tools(ctx).await?;
    let mut registered = HashSet::new();

    for tool in &tools {
        if !include.is_empty() && !include.iter().any(|name| name == &tool.name) {
            debug!(server = server, tool = %tool.name, "Tool not in include list, skipping");
            continue;
        }
        if exclude.iter().any(|name| name == &tool.name) {
            debug!(server = server, tool = %tool.name, "Tool excluded, skipping");
            continue;
        }
        if sanitize(&tool.name).is_empty() {
            warn!(server = server, tool = %tool.name, "Tool name has no usable characters, skipping");
            continue;
        }

        let entry = RegistryEntry::for_client(server, tool, client);
        if !registered.insert(entry.name.clone()) {
            warn!(
                server = server,
                tool = %tool.name,
                name = %entry.name,
                "Duplicate bridged tool name, last definition wins"
            );
        }
        registry.register(entry);
    }

    debug!(server = server, registered = registered.len(), offered = tools.len(), "Bridged MCP tools");
    Ok(registered.len())
}
