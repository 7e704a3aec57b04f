//! # hearth-cli
//!
//! Command-line host for the Hearth MCP runtime.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hearth_core::error::format_error_with_suggestion;
use hearth_core::Config;

mod commands;

/// Hearth - talk to MCP servers and use their tools
#[derive(Parser)]
#[command(name = "hearth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered above the user and project files
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured MCP servers
    Servers,
    /// Start all servers and list their bridged tools
    Tools,
    /// Invoke a bridged tool
    Call {
        /// Namespaced tool name (e.g. mcp_home_get_state)
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, value_name = "JSON")]
        args: Option<String>,
    },
    /// Subscribe to server events and print them as JSON lines
    Watch {
        /// Server name
        server: String,
        /// Event types to subscribe to
        #[arg(required = true)]
        event_types: Vec<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<hearth_core::Error>() {
            Some(core) => eprintln!("Error: {}", format_error_with_suggestion(core)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_layered(cli.config.as_deref())?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Config { action } => commands::config::handle(action, &config),
        Commands::Version => {
            println!("hearth {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            config.ensure_valid()?;
            match command {
                Commands::Servers => commands::mcp::servers(&config),
                Commands::Tools => commands::mcp::tools(&config).await,
                Commands::Call { tool, args } => commands::mcp::call(&config, &tool, args.as_deref()).await,
                Commands::Watch { server, event_types } => {
                    commands::mcp::watch(&config, &server, &event_types).await
                }
                Commands::Config { .. } | Commands::Version => Ok(()),
            }
        }
    }
}

/// Log to stderr so stdout stays machine-readable.
fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
