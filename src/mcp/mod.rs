//! Line-delimited JSON-RPC 2.0 over stdio, exposing the tool registry to an
//! MCP client.

use std::io::{self, BufRead, Write};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::tools::Dispatcher;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "darktable-mcp-bridge";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Reads requests from `reader` until EOF and writes one response line per
/// request. Notifications get no reply.
pub fn serve_stdio<R, W>(dispatcher: &Dispatcher, reader: R, mut writer: W) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    info!(tools = dispatcher.registry().names().len(), "stdio server ready");
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(trimmed) {
            Ok(message) => handle_message(dispatcher, &message),
            Err(err) => {
                warn!(error = %err, "unparseable request line");
                Some(error_reply(Value::Null, PARSE_ERROR, format!("Parse error: {err}")))
            }
        };
        if let Some(reply) = reply {
            serde_json::to_writer(&mut writer, &reply)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
    }
    info!("stdin closed, stdio server exiting");
    Ok(())
}

pub fn handle_message(dispatcher: &Dispatcher, message: &Value) -> Option<Value> {
    let Some(object) = message.as_object() else {
        return Some(error_reply(
            Value::Null,
            INVALID_REQUEST,
            String::from("Invalid request"),
        ));
    };
    let id = object.get("id").cloned();
    let method = object.get("method").and_then(Value::as_str).unwrap_or_default();
    debug!(method, "rpc request");

    let outcome = match method {
        "notifications/initialized" | "initialized" => return None,
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tools_list(dispatcher)),
        "tools/call" => tools_call(dispatcher, object.get("params")),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
    };

    // Requests without an id are notifications.
    let id = id?;
    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => error_reply(id, code, message),
    })
}

fn tools_list(dispatcher: &Dispatcher) -> Value {
    let tools = dispatcher
        .registry()
        .specs()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "inputSchema": spec.input_schema()
            })
        })
        .collect::<Vec<_>>();
    json!({"tools": tools})
}

fn tools_call(dispatcher: &Dispatcher, params: Option<&Value>) -> Result<Value, (i64, String)> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| (INVALID_PARAMS, String::from("tools/call requires params.name")))?;
    let args = match params.and_then(|p| p.get("arguments")) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err((
                INVALID_PARAMS,
                String::from("tools/call arguments must be an object"),
            ))
        }
    };

    let (text, is_error) = match dispatcher.invoke(name, &args) {
        Ok(text) => (text, false),
        Err(err) => (err.to_string(), true),
    };
    Ok(json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error
    }))
}

fn error_reply(id: Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
