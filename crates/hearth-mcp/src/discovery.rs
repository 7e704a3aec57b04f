//! MCP server management.
//!
//! `McpServerManager` owns the configured servers, one client per running
//! server and the shared tool registry. It also runs the supervisor that
//! reconnects a server once its readiness probe says it is back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hearth_core::config::{Config, McpConfig, McpServerConfig};
use hearth_core::tool::sanitize;

use crate::bridge::{bridge, ToolRegistry};
use crate::client::{ConnectionState, McpClient};
use crate::context::CallContext;
use crate::error::McpError;
use crate::probe::ReadinessProbe;
use crate::transport::{connector_for, Connect};

type ConnectorFactory = dyn Fn(&McpServerConfig, &McpConfig) -> Result<Box<dyn Connect>, McpError> + Send + Sync;

/// Manages MCP server connections and tool registration.
pub struct McpServerManager {
    /// Settings shared by every client.
    config: Config,
    /// Server configurations.
    configs: RwLock<Vec<McpServerConfig>>,
    /// Running clients by server name.
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    registry: Arc<ToolRegistry>,
    connector_factory: Box<ConnectorFactory>,
}

impl McpServerManager {
    /// Create a manager for the servers in `config`.
    pub fn new(config: &Config) -> Self {
        let mut config = config.clone();
        let configs = std::mem::take(&mut config.mcp.servers);
        Self {
            config,
            configs: RwLock::new(configs),
            clients: RwLock::new(HashMap::new()),
            registry: Arc::new(ToolRegistry::new()),
            connector_factory: Box::new(connector_for),
        }
    }

    /// Replace how connectors are built from server configuration.
    pub fn with_connector_factory(
        mut self,
        factory: impl Fn(&McpServerConfig, &McpConfig) -> Result<Box<dyn Connect>, McpError> + Send + Sync + 'static,
    ) -> Self {
        self.connector_factory = Box::new(factory);
        self
    }

    /// The registry every running server is bridged into.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Add a server configuration.
    ///
    /// Labels that sanitize to the same string would share a namespace and
    /// are rejected.
    pub async fn add_config(&self, config: McpServerConfig) -> Result<(), McpError> {
        let mut configs = self.configs.write().await;
        let label = sanitize(&config.name);
        if configs.iter().any(|c| sanitize(&c.name) == label) {
            return Err(McpError::ServerAlreadyExists(config.name));
        }
        configs.push(config);
        Ok(())
    }

    /// Remove a server configuration by name. A running server is stopped
    /// first so none of its tools outlive the configuration.
    pub async fn remove_config(&self, name: &str) -> bool {
        if self.client(name).await.is_some() {
            if let Err(e) = self.stop_server(name).await {
                warn!(server = name, error = %e, "Failed to stop server while removing its configuration");
            }
        }

        let mut configs = self.configs.write().await;
        let original_len = configs.len();
        configs.retain(|c| c.name != name);
        configs.len() < original_len
    }

    /// Get all server configurations.
    pub async fn list_configs(&self) -> Vec<McpServerConfig> {
        self.configs.read().await.clone()
    }

    /// Get a server configuration by name.
    pub async fn get_config(&self, name: &str) -> Option<McpServerConfig> {
        self.configs
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Start all enabled servers.
    ///
    /// Servers that fail to start are logged but don't prevent other servers
    /// from starting.
    pub async fn start_all(&self, ctx: &CallContext) -> StartReport {
        let configs = self.configs.read().await.clone();

        info!(count = configs.len(), "Starting MCP servers");

        let mut report = StartReport::default();
        for config in configs {
            if !config.enabled {
                debug!(server = %config.name, "Skipping disabled server");
                report.skipped.push(config.name);
                continue;
            }

            match self.start_server(ctx, &config.name).await {
                Ok(tool_count) => report.started.push((config.name, tool_count)),
                Err(e) => {
                    error!(server = %config.name, error = %e, "Failed to start server");
                    report.failed.push((config.name, e.to_string()));
                }
            }
        }

        info!(
            success = report.started.len(),
            failed = report.failed.len(),
            "MCP servers started"
        );

        report
    }

    /// Start a server by name and bridge its tools.
    ///
    /// Returns the number of tools bridged.
    pub async fn start_server(&self, ctx: &CallContext, name: &str) -> Result<usize, McpError> {
        let config = self
            .get_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        if self.clients.read().await.contains_key(name) {
            return Err(McpError::ServerAlreadyExists(name.to_string()));
        }

        info!(server = %config.name, transport = %config.transport, endpoint = config.target(), "Starting MCP server");

        let connector = (self.connector_factory)(&config, &self.config.mcp)?;
        let client = Arc::new(McpClient::new(&config.name, connector).configured(&self.config));

        let bridged = async {
            client.initialize(ctx).await?;
            bridge(&self.registry, &client, ctx, &config.name, &config.include, &config.exclude).await
        }
        .await;

        let tool_count = match bridged {
            Ok(count) => count,
            Err(e) => {
                self.registry.remove_server(&config.name);
                if let Err(close_err) = client.close().await {
                    debug!(server = %config.name, error = %close_err, "Error closing failed client");
                }
                return Err(e);
            }
        };

        let mut clients = self.clients.write().await;
        if clients.contains_key(name) {
            drop(clients);
            let _ = client.close().await;
            return Err(McpError::ServerAlreadyExists(name.to_string()));
        }
        clients.insert(config.name.clone(), client);

        info!(server = %config.name, tools = tool_count, "MCP server started");
        Ok(tool_count)
    }

    /// Stop a server and drop its tools.
    pub async fn stop_server(&self, name: &str) -> Result<(), McpError> {
        let client = self
            .clients
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        let removed = self.registry.remove_server(name);
        debug!(server = name, tools = removed, "Removed bridged tools");
        client.close().await
    }

    /// Stop all servers.
    pub async fn stop_all(&self) -> Result<(), McpError> {
        info!("Stopping all MCP servers");

        let clients: Vec<(String, Arc<McpClient>)> = self.clients.write().await.drain().collect();
        for (name, client) in clients {
            self.registry.remove_server(&name);
            if let Err(e) = client.close().await {
                error!(server = %name, error = %e, "Failed to close connection");
            }
        }

        Ok(())
    }

    /// Reconnect a running server and bridge its tools again.
    pub async fn reconnect_server(&self, ctx: &CallContext, name: &str) -> Result<usize, McpError> {
        let client = self
            .client(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        let config = self
            .get_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        client.reconnect(ctx).await?;
        self.registry.remove_server(name);
        bridge(&self.registry, &client, ctx, name, &config.include, &config.exclude).await
    }

    /// Get the client of a running server.
    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    /// List all running servers, sorted.
    pub async fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a server is running and ready.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.client(name).await.is_some_and(|c| c.is_ready())
    }

    /// Get server status.
    pub async fn server_status(&self, name: &str) -> ServerStatus {
        match self.client(name).await {
            Some(client) => ServerStatus::Running {
                state: client.state(),
                tool_count: self.registry.count_for(name),
            },
            None => ServerStatus::Stopped,
        }
    }

    /// Watch one server and reconnect it when it drops and `probe` is ready.
    ///
    /// Every `interval` a ready client is pinged; a lost connection shows up
    /// as a non-ready state on a later tick. The task ends when `shutdown`
    /// fires or the server is stopped.
    pub fn supervise(
        self: &Arc<Self>,
        name: impl Into<String>,
        probe: Arc<dyn ReadinessProbe>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let name = name.into();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(client) = manager.client(&name).await else {
                    debug!(server = %name, "Server stopped, ending supervision");
                    break;
                };
                let ctx = CallContext::with_token(shutdown.child_token()).with_timeout(interval);

                match client.state() {
                    ConnectionState::Ready => {
                        if let Err(e) = client.ping(&ctx).await {
                            warn!(server = %name, error = %e, "Ping failed");
                        }
                    }
                    ConnectionState::Closed => break,
                    _ => {
                        if !probe.is_ready().await {
                            debug!(server = %name, "Server not reachable yet");
                            continue;
                        }
                        match manager.reconnect_server(&ctx, &name).await {
                            Ok(tools) => info!(server = %name, tools = tools, "Server restored"),
                            Err(e) => warn!(server = %name, error = %e, "Reconnect failed"),
                        }
                    }
                }
            }
        })
    }
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// Outcome of [`McpServerManager::start_all`].
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    /// Started servers with their bridged tool counts.
    pub started: Vec<(String, usize)>,
    /// Servers that failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Disabled servers.
    pub skipped: Vec<String>,
}

impl StartReport {
    pub fn tool_count(&self) -> usize {
        self.started.iter().map(|(_, count)| count).sum()
    }
}

/// Status of an MCP server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerStatus {
    /// Server is not running.
    Stopped,
    /// Server has a client.
    Running {
        /// Connection state.
        state: ConnectionState,
        /// Number of bridged tools.
        tool_count: usize,
    },
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running { state, tool_count } => {
                write!(f, "{} ({} tools)", state, tool_count)
            }
        }
    }
}
