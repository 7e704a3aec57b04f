//! Integration tests for the stdio transport against a real child process.
//!
//! The server under test is the `mcp_test_server` binary built from
//! `tests/helpers/mcp_test_server/main.rs`.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::{Config, McpServerConfig};
use hearth_mcp::{
    bridge, CallContext, ConnectionState, McpClient, McpError, McpServerManager, StdioConnector, ToolRegistry,
};
use serde_json::json;

const TEST_SERVER: &str = env!("CARGO_BIN_EXE_mcp_test_server");

fn connector() -> StdioConnector {
    StdioConnector::new("test", TEST_SERVER)
        .with_response_timeout(Duration::from_secs(10))
        .with_grace(Duration::from_secs(2))
}

async fn ready_client() -> Arc<McpClient> {
    let client = Arc::new(McpClient::new("test", Box::new(connector())));
    client.initialize(&CallContext::new()).await.unwrap();
    client
}

#[tokio::test]
async fn test_handshake_and_discovery() {
    let client = ready_client().await;
    let ctx = CallContext::new();

    assert_eq!(client.state(), ConnectionState::Ready);
    let identity = client.server_info().unwrap();
    assert_eq!(identity.name, "mcp-test-server");
    assert_eq!(identity.protocol_version, "2024-11-05");

    let tools = client.list_tools(&ctx).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["echo", "get_state", "mixed", "fail", "slow", "crash", "big"]);
    assert_eq!(tools[1].input_schema["required"], json!(["entity_id"]));
    // A tool without a schema gets the empty object schema.
    assert_eq!(tools[2].input_schema, json!({"type": "object"}));

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_tool_calls() {
    let client = ready_client().await;
    let ctx = CallContext::new();

    let echoed = client
        .call_tool(&ctx, "echo", json!({"message": "hello"}))
        .await
        .unwrap();
    assert_eq!(echoed, "hello");

    let state = client
        .call_tool(&ctx, "get_state", json!({"entity_id": "light.kitchen"}))
        .await
        .unwrap();
    assert_eq!(state, "light.kitchen is on");

    let mixed = client.call_tool(&ctx, "mixed", json!({})).await.unwrap();
    assert_eq!(mixed, "first\n[image]\n[resource]");

    let err = client.call_tool(&ctx, "fail", json!({})).await.unwrap_err();
    match err {
        McpError::Tool { tool, message, .. } => {
            assert_eq!(tool, "fail");
            assert_eq!(message, "tool failed on purpose");
        }
        other => panic!("expected tool error, got {other:?}"),
    }

    let err = client.call_tool(&ctx, "nope", json!({})).await.unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32602));
    assert!(client.is_ready());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_large_response() {
    let client = ready_client().await;

    let text = client
        .call_tool(&CallContext::new(), "big", json!({}))
        .await
        .unwrap();
    assert_eq!(text.len(), 2 * 1024 * 1024);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let client = ready_client().await;

    let calls = (0..16).map(|i| {
        let client = client.clone();
        async move {
            let reply = client
                .call_tool(&CallContext::new(), "echo", json!({"message": format!("m{i}")}))
                .await
                .unwrap();
            (i, reply)
        }
    });

    for (i, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply, format!("m{i}"));
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_deadline_expires_and_client_stays_ready() {
    let client = ready_client().await;

    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
    let err = client
        .call_tool(&ctx, "slow", json!({"ms": 500}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout { .. }), "got {err:?}");
    assert!(client.is_ready());

    // The late reply to the abandoned call is discarded.
    client.ping(&CallContext::new()).await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_delivers_events() {
    let client = ready_client().await;
    let mut events = client.take_events().unwrap();

    client
        .subscribe(&CallContext::new(), "state_changed")
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "state_changed");
    assert_eq!(event.origin, "LOCAL");
    assert_eq!(event.data["entity_id"], "light.kitchen");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_server_exit_then_reconnect() {
    let client = ready_client().await;
    let ctx = CallContext::new();

    client.subscribe(&ctx, "state_changed").await.unwrap();

    let err = client.call_tool(&ctx, "crash", json!({})).await.unwrap_err();
    assert!(err.is_connection_loss(), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.cached_tools().is_none());

    client.reconnect(&ctx).await.unwrap();
    assert!(client.is_ready());
    assert_eq!(client.subscriptions(), ["state_changed"]);

    let echoed = client
        .call_tool(&ctx, "echo", json!({"message": "back"}))
        .await
        .unwrap();
    assert_eq!(echoed, "back");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_bridged_tools_proxy_to_the_server() {
    let client = ready_client().await;
    let ctx = CallContext::new();
    let registry = ToolRegistry::new();

    let include = vec!["echo".to_string(), "get_state".to_string(), "fail".to_string()];
    let exclude = vec!["fail".to_string()];
    let count = bridge(&registry, &client, &ctx, "Living Room", &include, &exclude)
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(registry.names(), ["mcp_living_room_echo", "mcp_living_room_get_state"]);

    let reply = registry
        .invoke(ctx, "mcp_living_room_echo", json!({"message": "via bridge"}))
        .await
        .unwrap();
    assert_eq!(reply, "via bridge");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_manager_runs_configured_server() {
    let mut config = Config::default();
    config.mcp.servers.push(McpServerConfig::stdio("home", TEST_SERVER));
    config.mcp.servers.push(McpServerConfig {
        enabled: false,
        ..McpServerConfig::stdio("off", TEST_SERVER)
    });

    let manager = McpServerManager::new(&config);
    let ctx = CallContext::new();

    let report = manager.start_all(&ctx).await;
    assert_eq!(report.started, [("home".to_string(), 7)]);
    assert_eq!(report.skipped, ["off"]);
    assert!(report.failed.is_empty());

    let registry = manager.registry();
    let state = registry
        .invoke(ctx, "mcp_home_get_state", json!({"entity_id": "switch.fan"}))
        .await
        .unwrap();
    assert_eq!(state, "switch.fan is on");

    manager.stop_all().await.unwrap();
    assert!(registry.is_empty());
    assert!(!manager.is_connected("home").await);
}

#[tokio::test]
async fn test_missing_executable_fails_to_start() {
    let client = McpClient::new("ghost", Box::new(StdioConnector::new("ghost", "/nonexistent/mcp-server")));
    let err = client.initialize(&CallContext::new()).await.unwrap_err();
    assert!(!client.is_ready());
    assert!(matches!(err, McpError::Transport { .. }), "got {err:?}");
    assert!(err.to_string().contains("failed to spawn"), "got {err}");
}
