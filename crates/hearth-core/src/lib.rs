//! # hearth-core
//!
//! Core types shared by the Hearth host and its MCP runtime.
//!
//! This crate provides:
//! - Layered configuration, including the per-server MCP settings
//! - Host-visible tool definitions
//! - Common error types

pub mod config;
pub mod error;
pub mod tool;

pub use config::{Config, IssueSeverity, McpServerConfig, TransportKind, ValidationIssue, ValidationResult};
pub use error::{Error, Result};
pub use tool::{sanitize, ToolCategory, ToolDefinition};
