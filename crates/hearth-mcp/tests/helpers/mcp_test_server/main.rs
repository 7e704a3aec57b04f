//! Minimal MCP server over stdio, used by the integration tests.
//!
//! Reads one JSON-RPC message per line from stdin and writes one response
//! per line to stdout. Tools:
//!
//! - `echo`: returns the `message` argument
//! - `get_state`: returns `"<entity_id> is on"`
//! - `mixed`: text, image and resource content blocks
//! - `fail`: a result flagged `isError`
//! - `slow`: sleeps `ms` milliseconds before answering
//! - `crash`: exits without answering
//! - `big`: a 2 MiB text block
//!
//! After `subscribe_events` it emits one `event` notification of the
//! subscribed type.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                write_line(&mut out, &error(&Value::Null, -32700, "Parse error"));
                continue;
            }
        };

        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            // Notifications get no reply.
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => write_line(&mut out, &success(&id, initialize_result())),
            "tools/list" => write_line(&mut out, &success(&id, tools_list())),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                if name == "crash" {
                    std::process::exit(3);
                }
                let reply = match call_tool(name, &args) {
                    Ok(result) => success(&id, result),
                    Err(message) => error(&id, -32602, &message),
                };
                write_line(&mut out, &reply);
            }
            "ping" => write_line(&mut out, &success(&id, json!({}))),
            "subscribe_events" => {
                let event_type = params
                    .get("event_type")
                    .and_then(Value::as_str)
                    .unwrap_or("state_changed")
                    .to_string();
                write_line(&mut out, &success(&id, json!({})));
                let event = json!({
                    "jsonrpc": "2.0",
                    "method": "event",
                    "params": {
                        "type": event_type,
                        "data": {"entity_id": "light.kitchen", "state": "on"},
                        "origin": "LOCAL",
                    }
                });
                write_line(&mut out, &event);
            }
            other => write_line(&mut out, &error(&id, -32601, &format!("Method not found: {other}"))),
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "mcp-test-server", "version": "0.1.0"}
    })
}

fn tools_list() -> Value {
    let string_arg = |name: &str| {
        json!({
            "type": "object",
            "properties": {name: {"type": "string"}},
            "required": [name]
        })
    };
    json!({
        "tools": [
            {"name": "echo", "description": "Echo a message", "inputSchema": string_arg("message")},
            {"name": "get_state", "description": "Read an entity state", "inputSchema": string_arg("entity_id")},
            {"name": "mixed", "description": "Mixed content blocks"},
            {"name": "fail", "description": "Always fails"},
            {"name": "slow", "description": "Answers after a delay", "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}}
            }},
            {"name": "crash", "description": "Exits without answering"},
            {"name": "big", "description": "Returns a 2 MiB text block"}
        ]
    })
}

fn call_tool(name: &str, args: &Value) -> Result<Value, String> {
    let text = |s: String| json!({"content": [{"type": "text", "text": s}]});
    match name {
        "echo" => {
            let message = args.get("message").and_then(Value::as_str).unwrap_or("");
            Ok(text(message.to_string()))
        }
        "get_state" => {
            let entity = args
                .get("entity_id")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing entity_id".to_string())?;
            Ok(text(format!("{entity} is on")))
        }
        "mixed" => Ok(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///tmp/x", "text": "body"}}
            ]
        })),
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "tool failed on purpose"}],
            "isError": true
        })),
        "slow" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(text("done".to_string()))
        }
        "big" => Ok(text("x".repeat(2 * 1024 * 1024))),
        other => Err(format!("Unknown tool: {other}")),
    }
}

fn success(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn write_line(out: &mut impl Write, message: &Value) {
    let Ok(line) = serde_json::to_string(message) else { return };
    if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
        std::process::exit(0);
    }
}
