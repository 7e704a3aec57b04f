//! Error types for Hearth.
//!
//! Library crates keep their own error enums; everything that reaches the
//! host funnels into [`Error`], which can attach a recovery suggestion.

use thiserror::Error;

/// Result type alias using the Hearth [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Hearth.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// A named tool, server or file does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/hearth/config.toml"),
            Error::Mcp(_) => Some("Run 'hearth servers' and check that the server is reachable"),
            Error::NotFound(_) => Some("Use 'hearth tools' to see the bridged tool names"),
            Error::Validation(_) => Some("Run 'hearth config check' for the full list of issues"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
