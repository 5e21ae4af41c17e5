//! GraphQL-over-WebSocket message framing for both supported dialects.

use serde::Deserialize;
use serde_json::{Value, json};
use tailview_api_types::GraphQlRequest;

use crate::infra::error::InfraError;

/// Sub-protocols offered during the handshake, preferred first.
pub const SUBPROTOCOLS: [&str; 2] = [Dialect::Modern.subprotocol(), Dialect::Legacy.subprotocol()];

/// Wire dialect negotiated through `Sec-WebSocket-Protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `graphql-transport-ws`: subscribe / next / complete / ping / pong.
    Modern,
    /// `graphql-ws` (subscriptions-transport-ws): start / data / stop / ka.
    Legacy,
}

impl Dialect {
    /// Servers that do not echo a sub-protocol are assumed to speak the modern one.
    pub fn from_subprotocol(subprotocol: Option<&str>) -> Self {
        match subprotocol.map(str::trim) {
            Some("graphql-ws") => Dialect::Legacy,
            _ => Dialect::Modern,
        }
    }

    pub const fn subprotocol(self) -> &'static str {
        match self {
            Dialect::Modern => "graphql-transport-ws",
            Dialect::Legacy => "graphql-ws",
        }
    }

    fn start_type(self) -> &'static str {
        match self {
            Dialect::Modern => "subscribe",
            Dialect::Legacy => "start",
        }
    }

    fn stop_type(self) -> &'static str {
        match self {
            Dialect::Modern => "complete",
            Dialect::Legacy => "stop",
        }
    }
}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ConnectionInit,
    Start { id: String, request: GraphQlRequest },
    Stop { id: String },
    Ping,
    Pong { payload: Option<Value> },
}

impl ClientMessage {
    pub fn encode(&self, dialect: Dialect) -> String {
        let message = match self {
            ClientMessage::ConnectionInit => json!({ "type": "connection_init", "payload": {} }),
            ClientMessage::Start { id, request } => json!({
                "id": id,
                "type": dialect.start_type(),
                "payload": request,
            }),
            ClientMessage::Stop { id } => json!({ "id": id, "type": dialect.stop_type() }),
            ClientMessage::Ping => json!({ "type": "ping" }),
            ClientMessage::Pong { payload } => match payload {
                Some(payload) => json!({ "type": "pong", "payload": payload }),
                None => json!({ "type": "pong" }),
            },
        };
        message.to_string()
    }
}

/// Messages the server sends, normalized across dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionAck,
    /// `next` (modern) or `data` (legacy).
    Data { id: Option<String>, payload: Value },
    Error { id: Option<String>, payload: Value },
    ConnectionError { payload: Value },
    Complete { id: Option<String> },
    Ping { payload: Option<Value> },
    Pong,
    /// Legacy keep-alive.
    KeepAlive,
    Unknown(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, InfraError> {
        let raw: RawMessage = serde_json::from_str(text)
            .map_err(|err| InfraError::decode(format!("malformed subscription frame: {err}")))?;
        let payload = raw.payload;

        Ok(match raw.kind.as_str() {
            "connection_ack" => ServerMessage::ConnectionAck,
            "next" | "data" => ServerMessage::Data {
                id: raw.id,
                payload: payload.unwrap_or(Value::Null),
            },
            "error" => ServerMessage::Error {
                id: raw.id,
                payload: payload.unwrap_or(Value::Null),
            },
            "connection_error" => ServerMessage::ConnectionError {
                payload: payload.unwrap_or(Value::Null),
            },
            "complete" => ServerMessage::Complete { id: raw.id },
            "ping" => ServerMessage::Ping { payload },
            "pong" => ServerMessage::Pong,
            "ka" => ServerMessage::KeepAlive,
            _ => ServerMessage::Unknown(raw.kind),
        })
    }
}

/// Human-readable text of an `error` or `connection_error` payload.
///
/// Payloads are either one error object or an array of them.
pub fn error_message(payload: &Value) -> String {
    let messages: Vec<&str> = match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("message").and_then(Value::as_str))
            .collect(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .into_iter()
            .collect(),
    };
    if messages.is_empty() {
        payload.to_string()
    } else {
        messages.join(", ")
    }
}
