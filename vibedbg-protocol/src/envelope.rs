//! The envelope and its four typed payloads (§3 of the spec).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque, unique-per-request identifier. The source uses a hyphenated
/// 36-character hex layout, i.e. a UUID v4 string; we use the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Command = 1,
    Response = 2,
    Error = 3,
    Heartbeat = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Heartbeat),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub request_id: RequestId,
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default)]
    pub timestamp: i64,
}

fn default_timeout_ms() -> u32 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error_message: String,
    pub execution_time_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<Value>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub error_code: u32,
    pub category: u8,
    pub error_message: String,
    pub suggestion: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub session_info: Value,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
    Heartbeat(HeartbeatPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Command(_) => MessageType::Command,
            Payload::Response(_) => MessageType::Response,
            Payload::Error(_) => MessageType::Error,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub protocol_version: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            payload,
        }
    }
}
