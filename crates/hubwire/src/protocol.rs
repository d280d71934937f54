//! Hub wire protocol: JSON messages framed by an ASCII record separator.
//!
//! ```text
//! client → hub   {"protocol":"json","version":1}␞
//! hub → client   {}␞
//! hub → client   {"type":1,"target":"Event","arguments":[{...}]}␞
//! client → hub   {"type":1,"invocationId":"1","target":"Join","arguments":["events"]}␞
//! hub → client   {"type":3,"invocationId":"1","result":null}␞
//! ```
//!
//! A single WebSocket frame may carry several records. Records go out as
//! UTF-8 text frames; binary frames from the hub are decoded the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, HubResult};

/// Terminates every record on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub method names used by this client.
pub struct HubMethods;

impl HubMethods {
    /// Inbound: the hub pushes one event per invocation.
    pub const EVENT: &'static str = "Event";
    /// Outbound: join a logical group.
    pub const JOIN: &'static str = "Join";
    /// Outbound: leave a logical group.
    pub const LEAVE: &'static str = "Leave";
}

/// Numeric `type` discriminants of hub messages.
pub struct MessageType;

impl MessageType {
    pub const INVOCATION: u8 = 1;
    pub const STREAM_ITEM: u8 = 2;
    pub const COMPLETION: u8 = 3;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// First record sent by the client after the WebSocket upgrade.
#[derive(Debug, Serialize)]
pub struct HandshakeRequest {
    pub protocol: &'static str,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json",
            version: 1,
        }
    }
}

impl HandshakeRequest {
    /// Serialize with the trailing record separator.
    pub fn encode(&self) -> HubResult<String> {
        let mut json = serde_json::to_string(self)?;
        json.push(RECORD_SEPARATOR);
        Ok(json)
    }
}

/// First record sent by the hub. An `error` means the hub refused us.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Split the handshake response off the front of a frame.
///
/// Returns the parsed response and whatever records followed it in the
/// same frame.
pub fn decode_handshake(payload: &str) -> HubResult<(HandshakeResponse, &str)> {
    let Some(end) = payload.find(RECORD_SEPARATOR) else {
        return Err(HubError::ProtocolError {
            reason: "handshake response is missing its record separator".into(),
        });
    };
    let response: HandshakeResponse =
        serde_json::from_str(&payload[..end]).map_err(|e| HubError::ProtocolError {
            reason: format!("invalid handshake response: {e}"),
        })?;
    Ok((response, &payload[end + RECORD_SEPARATOR.len_utf8()..]))
}

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a method on the other side. `invocation_id` is present when a
    /// completion is expected.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },

    /// Outcome of an earlier invocation.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Keep-alive.
    Ping,

    /// The hub is closing the connection.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

/// Flat wire shape shared by every message type.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Build an outbound invocation that expects a completion.
    pub fn invocation(invocation_id: u64, target: &str, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: Some(invocation_id.to_string()),
            target: target.to_string(),
            arguments,
        }
    }

    /// Serialize with the trailing record separator.
    pub fn encode(&self) -> HubResult<String> {
        let raw = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawMessage {
                kind: MessageType::INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawMessage::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawMessage {
                kind: MessageType::COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawMessage::default()
            },
            HubMessage::Ping => RawMessage {
                kind: MessageType::PING,
                ..RawMessage::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawMessage {
                kind: MessageType::CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawMessage::default()
            },
        };

        let mut json = serde_json::to_string(&raw)?;
        json.push(RECORD_SEPARATOR);
        Ok(json)
    }

    /// Decode every record in a frame.
    ///
    /// A record that fails to decode is logged and skipped; the records
    /// around it are still returned. Message types this client does not
    /// handle (stream items, stream invocations, acks) are skipped too.
    pub fn decode_frames(payload: &str) -> Vec<HubMessage> {
        payload
            .split(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
            .filter_map(|record| match Self::decode_record(record) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable hub record");
                    None
                }
            })
            .collect()
    }

    /// Decode one record without its separator. `Ok(None)` for unsupported types.
    pub fn decode_record(record: &str) -> HubResult<Option<HubMessage>> {
        let raw: RawMessage = serde_json::from_str(record).map_err(|e| HubError::ProtocolError {
            reason: format!("invalid hub message: {e}"),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMessage) -> HubResult<Option<Self>> {
        let message = match raw.kind {
            MessageType::INVOCATION => {
                let target = raw.target.ok_or_else(|| HubError::ProtocolError {
                    reason: "invocation without target".into(),
                })?;
                HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments.unwrap_or_default(),
                }
            }
            MessageType::COMPLETION => {
                let invocation_id = raw.invocation_id.ok_or_else(|| HubError::ProtocolError {
                    reason: "completion without invocationId".into(),
                })?;
                HubMessage::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                }
            }
            MessageType::PING => HubMessage::Ping,
            MessageType::CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
            other => {
                tracing::trace!(kind = other, "Skipping unsupported hub message type");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

/// An application event pushed by the hub through the `Event` method.
///
/// `kind` is the discriminant used for dispatch; `payload` is left opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type", alias = "Type", alias = "kind", alias = "Kind")]
    pub kind: String,

    #[serde(default, alias = "Payload", alias = "data", alias = "Data")]
    pub payload: Value,
}

impl EventMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Decode the single argument of an `Event` invocation.
    pub fn from_argument(argument: Value) -> HubResult<Self> {
        serde_json::from_value(argument).map_err(|e| HubError::ProtocolError {
            reason: format!("invalid event message: {e}"),
        })
    }
}
