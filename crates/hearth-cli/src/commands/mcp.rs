//! MCP server commands.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hearth_core::Config;
use hearth_mcp::{CallContext, McpServerManager, TcpProbe};

/// List configured servers.
pub fn servers(config: &Config) -> anyhow::Result<()> {
    if config.mcp.servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    for server in &config.mcp.servers {
        let enabled = if server.enabled { "enabled" } else { "disabled" };
        println!("{}\t{}\t{}\t{}", server.name, server.transport, server.target(), enabled);
    }
    Ok(())
}

/// Start every server and print the bridged tools.
pub async fn tools(config: &Config) -> anyhow::Result<()> {
    let manager = McpServerManager::new(config);
    let ctx = CallContext::new();

    let report = manager.start_all(&ctx).await;
    for (name, error) in &report.failed {
        eprintln!("{}: {}", name, error);
    }

    for tool in manager.registry().definitions() {
        println!("{}\t{}", tool.name, tool.description);
    }

    manager.stop_all().await?;
    Ok(())
}

/// Invoke one bridged tool and print its flattened result.
pub async fn call(config: &Config, tool: &str, args: Option<&str>) -> anyhow::Result<()> {
    let args: Value = match args {
        Some(raw) => serde_json::from_str(raw).map_err(hearth_core::Error::from)?,
        None => Value::Object(Default::default()),
    };

    let manager = McpServerManager::new(config);
    let token = CancellationToken::new();
    let ctx = CallContext::with_token(token.clone());

    let report = manager.start_all(&ctx).await;
    for (name, error) in &report.failed {
        tracing::warn!(server = %name, "Server unavailable: {}", error);
    }

    let registry = manager.registry();
    let result = tokio::select! {
        result = registry.invoke(ctx, tool, args) => result,
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            Err(hearth_mcp::McpError::Cancelled { method: tool.to_string() })
        }
    };

    manager.stop_all().await?;

    let text = result.map_err(hearth_core::Error::from)?;
    println!("{}", text);
    Ok(())
}

/// Print events from one server until Ctrl-C.
pub async fn watch(config: &Config, server: &str, event_types: &[String]) -> anyhow::Result<()> {
    let server_config = config
        .mcp
        .server(server)
        .ok_or_else(|| hearth_core::Error::NotFound(format!("server '{}'", server)))?
        .clone();

    let manager = Arc::new(McpServerManager::new(config));
    let ctx = CallContext::new();

    manager
        .start_server(&ctx, server)
        .await
        .map_err(hearth_core::Error::from)?;
    let client = manager
        .client(server)
        .await
        .ok_or_else(|| hearth_core::Error::NotFound(format!("server '{}'", server)))?;

    let mut events = client
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event stream for '{}' is already taken", server))?;

    for event_type in event_types {
        client
            .subscribe(&ctx, event_type)
            .await
            .map_err(hearth_core::Error::from)?;
    }

    let shutdown = CancellationToken::new();
    let supervisor = server_config.probe.as_ref().map(|target| {
        manager.supervise(
            server,
            Arc::new(TcpProbe::new(target.clone())),
            config.mcp.probe_interval(),
            shutdown.clone(),
        )
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    shutdown.cancel();
    if let Some(handle) = supervisor {
        let _ = handle.await;
    }
    manager.stop_all().await?;

    let dropped = client.dropped_events();
    if dropped > 0 {
        tracing::warn!(server = server, dropped = dropped, "Events were dropped");
    }
    Ok(())
}
