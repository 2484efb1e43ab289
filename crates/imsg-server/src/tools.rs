//! JSON-RPC dispatch for the message-history tool server.

use imsg_core::rpc::{
    encode_frame, FrameError, RpcRequest, RpcResponse, DEFAULT_MAX_FRAME_BYTES, INVALID_PARAMS,
    METHOD_NOT_FOUND,
};
use imsg_query::{
    ListArgs, QueryError, QueryFacade, ReadArgs, RecentArgs, SearchArgs, StoreSource,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "imsg";

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    ListConversations(ListArgs),
    SearchConversations(SearchArgs),
    ReadMessages(ReadArgs),
    GetRecentMessages(RecentArgs),
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ListConversations(_) => "list_conversations",
            ToolCall::SearchConversations(_) => "search_conversations",
            ToolCall::ReadMessages(_) => "read_messages",
            ToolCall::GetRecentMessages(_) => "get_recent_messages",
        }
    }

    /// Missing or null arguments mean "all defaults".
    pub fn parse(name: &str, arguments: Option<&Value>) -> Result<Self, QueryError> {
        let arguments = match arguments {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(value) => value.clone(),
        };
        match name {
            "list_conversations" => Ok(ToolCall::ListConversations(arguments_of(arguments)?)),
            "search_conversations" => {
                Ok(ToolCall::SearchConversations(arguments_of(arguments)?))
            }
            "read_messages" => Ok(ToolCall::ReadMessages(arguments_of(arguments)?)),
            "get_recent_messages" => Ok(ToolCall::GetRecentMessages(arguments_of(arguments)?)),
            other => Err(QueryError::invalid(format!("unknown tool: {other}"))),
        }
    }
}

fn arguments_of<T: DeserializeOwned>(arguments: Value) -> Result<T, QueryError> {
    serde_json::from_value(arguments).map_err(|err| QueryError::invalid(err.to_string()))
}

pub struct ToolServer<S> {
    facade: QueryFacade<S>,
    max_frame_bytes: usize,
}

impl<S: StoreSource> ToolServer<S> {
    pub fn new(facade: QueryFacade<S>) -> Self {
        Self {
            facade,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Tool results that would not fit in one outbound frame become tool errors.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Returns `None` for notifications.
    pub fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        let started = Instant::now();
        let method = request.method.clone();
        let outcome = match method.as_str() {
            "initialize" => Ok(initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => self.call_tool(&request.params),
            _ if request.is_notification() => {
                debug!(event = "notification", method = %method);
                return None;
            }
            _ => Err(RpcResponse::failure(
                Value::Null,
                METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            )),
        };
        debug!(
            event = "request_handled",
            method = %method,
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        let id = request.id?;
        Some(match outcome {
            Ok(result) if method == "tools/call" => self.fit_tool_result(id, result),
            Ok(result) => RpcResponse::success(id, result),
            Err(mut failure) => {
                failure.id = id;
                failure
            }
        })
    }

    fn call_tool(&self, params: &Value) -> Result<Value, RpcResponse> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(RpcResponse::failure(
                Value::Null,
                INVALID_PARAMS,
                "tools/call requires a tool name",
            ));
        };
        let result = ToolCall::parse(name, params.get("arguments"))
            .and_then(|call| self.run(call));
        Ok(match result {
            Ok(payload) => tool_text(payload, false),
            Err(err) => {
                warn!(event = "tool_error", tool = name, kind = ?err.kind(), error = %err);
                tool_text(format!("Error: {err}"), true)
            }
        })
    }

    fn fit_tool_result(&self, id: Value, result: Value) -> RpcResponse {
        let response = RpcResponse::success(id, result);
        match encode_frame(&response, self.max_frame_bytes) {
            Err(FrameError::OversizedFrame { size, max }) => {
                warn!(event = "tool_result_oversized", size, max);
                let text = format!(
                    "Error: response of {size} bytes exceeds the {max}-byte frame limit; retry with a smaller limit"
                );
                RpcResponse::success(response.id, tool_text(text, true))
            }
            _ => response,
        }
    }

    pub fn run(&self, call: ToolCall) -> Result<String, QueryError> {
        debug!(event = "tool_call", tool = call.name());
        match call {
            ToolCall::ListConversations(args) => render(&self.facade.list_conversations(args)?),
            ToolCall::SearchConversations(args) => {
                render(&self.facade.search_conversations(args)?)
            }
            ToolCall::ReadMessages(args) => render(&self.facade.read_messages(args)?),
            ToolCall::GetRecentMessages(args) => render(&self.facade.get_recent_messages(args)?),
        }
    }
}

pub fn render<T: Serialize>(value: &T) -> Result<String, QueryError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn tool_text(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "list_conversations",
            "description": "List conversations, most recently active first. Per-protocol duplicates of one chat appear once.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": 50 },
                    "include_sms": {
                        "type": "boolean",
                        "default": true,
                        "description": "Include SMS and other non-iMessage conversations"
                    }
                }
            }
        }),
        json!({
            "name": "search_conversations",
            "description": "Find conversations whose name, identifier or participants contain the query (case-insensitive).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "default": 20 }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "read_messages",
            "description": "Read messages from a conversation (numeric id) or a contact (phone number or email).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "identifier": {
                        "type": "string",
                        "description": "Conversation id from list_conversations, or a phone number or email"
                    },
                    "limit": { "type": "integer", "minimum": 1, "default": 50 },
                    "days_back": { "type": "integer", "minimum": 0, "default": 30 }
                },
                "required": ["identifier"]
            }
        }),
        json!({
            "name": "get_recent_messages",
            "description": "Recent messages across all conversations.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": 30 },
                    "hours_back": { "type": "integer", "minimum": 0, "default": 24 }
                }
            }
        }),
    ]
}
