//! Configuration system for Hearth.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::tool::sanitize;

/// Main configuration struct for Hearth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// MCP runtime settings and servers
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Name sent as `clientInfo.name` during the MCP handshake
    pub client_name: String,
    /// Version sent as `clientInfo.version`
    pub client_version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            client_name: "hearth".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Upper bound on waiting for any single response
    pub request_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for stdio servers
    pub shutdown_grace_secs: u64,
    /// Capacity of each client's event channel
    pub event_buffer: usize,
    /// How often the supervisor polls readiness probes
    pub probe_interval_secs: u64,
    /// Configured servers
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            shutdown_grace_secs: 5,
            event_buffer: 64,
            probe_interval_secs: 15,
            servers: Vec::new(),
        }
    }
}

impl McpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Find a server by its configured name.
    pub fn server(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// How the host talks to an MCP server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON on stdin/stdout
    #[default]
    Stdio,
    /// JSON-RPC over HTTP POST
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    /// Server label, also used for tool namespacing
    pub name: String,
    /// Transport variant
    pub transport: TransportKind,
    /// Executable (stdio)
    pub command: Option<String>,
    /// Argument vector (stdio)
    pub args: Vec<String>,
    /// Additional environment (stdio)
    pub env: HashMap<String, String>,
    /// Working directory (stdio)
    pub working_dir: Option<PathBuf>,
    /// Endpoint (http)
    pub url: Option<String>,
    /// Extra headers sent on every request (http)
    pub headers: HashMap<String, String>,
    /// Only bridge these tools, when non-empty
    pub include: Vec<String>,
    /// Never bridge these tools
    pub exclude: Vec<String>,
    /// Whether this server is started
    pub enabled: bool,
    /// `host:port` that must accept TCP connections before reconnecting
    pub probe: Option<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            transport: TransportKind::Stdio,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            enabled: true,
            probe: None,
        }
    }
}

impl McpServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add a header sent on every HTTP request.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Restrict bridging to these tool names.
    pub fn with_include(mut self, tools: Vec<String>) -> Self {
        self.include = tools;
        self
    }

    /// Skip these tool names when bridging.
    pub fn with_exclude(mut self, tools: Vec<String>) -> Self {
        self.exclude = tools;
        self
    }

    /// Set whether the server is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the readiness probe target.
    pub fn with_probe(mut self, target: impl Into<String>) -> Self {
        self.probe = Some(target.into());
        self
    }

    /// Command or URL, whichever the transport uses.
    pub fn target(&self) -> &str {
        match self.transport {
            TransportKind::Stdio => self.command.as_deref().unwrap_or(""),
            TransportKind::Http => self.url.as_deref().unwrap_or(""),
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "mcp.servers[0].url")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        write!(f, "{}: {}: {}", level, self.field, self.message)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(None).extract()
    }

    /// Load configuration, layering `path` above the user and project files.
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(Some(path)).extract()
    }

    fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".hearth/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".hearth/config.local.toml"));

        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed("HEARTH_").split("__"))
    }

    /// Load configuration, layering `explicit` above the user and project
    /// files when given. A named file that does not exist is an error.
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = explicit.filter(|path| !path.exists()) {
            return Err(Error::NotFound(path.display().to_string()));
        }
        Self::figment(explicit)
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Fail on validation errors; warnings are logged.
    pub fn ensure_valid(&self) -> Result<(), Error> {
        let result = self.validate();
        for warning in result.warnings() {
            tracing::warn!(field = %warning.field, "{}", warning.message);
        }

        let errors = result.errors();
        match errors.first() {
            None => Ok(()),
            Some(first) => Err(Error::Validation(format!(
                "{} configuration error(s), first: {}: {}",
                errors.len(),
                first.field,
                first.message
            ))),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.general.client_name.is_empty() {
            result.add_error("general.client_name", "client_name cannot be empty");
        }

        if self.mcp.request_timeout_secs == 0 {
            result.add_error("mcp.request_timeout_secs", "request_timeout_secs must be greater than 0");
        }

        if self.mcp.event_buffer == 0 {
            result.add_error("mcp.event_buffer", "event_buffer must be greater than 0");
        }

        if self.mcp.probe_interval_secs == 0 {
            result.add_error("mcp.probe_interval_secs", "probe_interval_secs must be greater than 0");
        }

        let mut seen = HashSet::new();
        for (index, server) in self.mcp.servers.iter().enumerate() {
            let field = |key: &str| format!("mcp.servers[{}].{}", index, key);

            if server.name.trim().is_empty() {
                result.add_error(field("name"), "Server name cannot be empty");
            } else if !seen.insert(sanitize(&server.name)) {
                result.add_error(
                    field("name"),
                    format!("Server name '{}' collides with an earlier server", server.name),
                );
            }

            match server.transport {
                TransportKind::Stdio => {
                    if server.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                        result.add_error(field("command"), "stdio servers require a command");
                    }
                }
                TransportKind::Http => match server.url.as_deref() {
                    None | Some("") => result.add_error(field("url"), "http servers require a url"),
                    Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                        result.add_error(field("url"), "url must start with http:// or https://");
                    }
                    Some(_) => {}
                },
            }

            if !server.include.is_empty() && !server.exclude.is_empty() {
                result.add_warning(
                    field("exclude"),
                    "include and exclude are both set; exclude only applies to included tools",
                );
            }

            if let Some(probe) = server.probe.as_deref() {
                if !probe.contains(':') {
                    result.add_error(field("probe"), "probe must be a host:port address");
                }
            }
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("hearth"))
            .unwrap_or_else(|| PathBuf::from("~/.config/hearth"))
    }
}
