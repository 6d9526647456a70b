//! Wire protocol codec (component E): framing, serialization, and parsing.
//!
//! Every failure mode here is a plain `CodecError` value, never a panic or
//! an exception caught broadly — see the REDESIGN FLAGS note on "exceptions
//! for control flow inside parsers".

use serde_json::{json, Value};

use crate::envelope::{
    CommandPayload, Envelope, ErrorPayload, HeartbeatPayload, MessageType, Payload, RequestId,
    ResponsePayload,
};
use crate::error::ErrorCode;

/// Terminates every message on the wire. Exactly four bytes.
pub const DELIMITER: &[u8] = b"\r\n\r\n";

/// Upper bound on a single serialized message, delimiter included.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Upper bound on `CommandPayload::command`, after trimming, in bytes.
pub const MAX_COMMAND_WIRE_LEN: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE}-byte limit")]
    TooLarge(usize),
    #[error("message does not end with the delimiter")]
    MissingDelimiter,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("missing or malformed field: {0}")]
    MissingField(String),
    #[error("unknown message_type: {0}")]
    UnknownMessageType(u8),
    #[error("envelope violates protocol invariants: {0}")]
    InvariantViolation(String),
}

impl CodecError {
    /// Every codec failure is, by definition, an `InvalidMessage`.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidMessage
    }
}

/// Finds the end (exclusive) of the first complete, delimiter-terminated
/// message in `buf`, without consuming anything. Used by the pipe server to
/// decide how much of its read buffer is one logical message versus an
/// unfinished tail waiting on the next read.
pub fn find_message_end(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
        .map(|i| i + DELIMITER.len())
}

fn check_size(buf: &[u8]) -> Result<(), CodecError> {
    if buf.is_empty() || buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }
    Ok(())
}

fn split_at_delimiter(buf: &[u8]) -> Result<&[u8], CodecError> {
    check_size(buf)?;
    let end = find_message_end(buf).ok_or(CodecError::MissingDelimiter)?;
    Ok(&buf[..end - DELIMITER.len()])
}

fn parse_json(body: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(body).map_err(|e| CodecError::InvalidJson(e.to_string()))
}

fn require_u32(v: &Value, field: &str) -> Result<u32, CodecError> {
    v.get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| CodecError::MissingField(field.to_owned()))
}

fn require_u8(v: &Value, field: &str) -> Result<u8, CodecError> {
    v.get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| CodecError::MissingField(field.to_owned()))
}

fn require_object<'a>(v: &'a Value, field: &str) -> Result<&'a Value, CodecError> {
    v.get(field)
        .filter(|p| p.is_object())
        .ok_or_else(|| CodecError::MissingField(field.to_owned()))
}

/// Parses a full envelope (any message type) out of a raw byte buffer,
/// enforcing the size bound *before* any JSON allocation happens.
pub fn parse_envelope(buf: &[u8]) -> Result<Envelope, CodecError> {
    let body = split_at_delimiter(buf)?;
    let outer = parse_json(body)?;

    let protocol_version = require_u32(&outer, "protocol_version")?;
    let message_type = require_u8(&outer, "message_type")?;
    let payload = require_object(&outer, "payload")?;

    let message_type = MessageType::try_from(message_type)
        .map_err(CodecError::UnknownMessageType)?;

    let payload = match message_type {
        MessageType::Command => Payload::Command(parse_command_payload(payload)?),
        MessageType::Response => Payload::Response(parse_response_payload(payload)?),
        MessageType::Error => Payload::Error(parse_error_payload(payload)?),
        MessageType::Heartbeat => Payload::Heartbeat(parse_heartbeat_payload(payload)?),
    };

    Ok(Envelope {
        protocol_version,
        payload,
    })
}

fn parse_command_payload(v: &Value) -> Result<CommandPayload, CodecError> {
    let payload: CommandPayload = serde_json::from_value(v.clone())
        .map_err(|e| CodecError::MissingField(format!("command payload: {e}")))?;
    if payload.request_id.0.is_empty() {
        return Err(CodecError::MissingField("request_id".to_owned()));
    }
    let trimmed = payload.command.trim();
    if trimmed.is_empty() {
        return Err(CodecError::MissingField("command".to_owned()));
    }
    if trimmed.len() > MAX_COMMAND_WIRE_LEN {
        return Err(CodecError::InvariantViolation(format!(
            "command of {} bytes exceeds {MAX_COMMAND_WIRE_LEN}-byte wire limit",
            trimmed.len()
        )));
    }
    Ok(payload)
}

fn parse_response_payload(v: &Value) -> Result<ResponsePayload, CodecError> {
    let payload: ResponsePayload = serde_json::from_value(v.clone())
        .map_err(|e| CodecError::MissingField(format!("response payload: {e}")))?;
    check_response_invariant(&payload)?;
    Ok(payload)
}

fn parse_error_payload(v: &Value) -> Result<ErrorPayload, CodecError> {
    serde_json::from_value(v.clone())
        .map_err(|e| CodecError::MissingField(format!("error payload: {e}")))
}

fn parse_heartbeat_payload(v: &Value) -> Result<HeartbeatPayload, CodecError> {
    serde_json::from_value(v.clone())
        .map_err(|e| CodecError::MissingField(format!("heartbeat payload: {e}")))
}

fn check_response_invariant(p: &ResponsePayload) -> Result<(), CodecError> {
    if p.success && !p.error_message.is_empty() {
        return Err(CodecError::InvariantViolation(
            "success=true requires an empty error_message".to_owned(),
        ));
    }
    if !p.success && p.error_message.is_empty() {
        return Err(CodecError::InvariantViolation(
            "success=false requires a non-empty error_message".to_owned(),
        ));
    }
    Ok(())
}

fn finish(mut body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    body.extend_from_slice(DELIMITER);
    check_size(&body)?;
    Ok(body)
}

pub fn serialize_command(p: &CommandPayload) -> Result<Vec<u8>, CodecError> {
    if p.request_id.0.is_empty() {
        return Err(CodecError::InvariantViolation(
            "request_id must not be empty".to_owned(),
        ));
    }
    if p.command.trim().len() > MAX_COMMAND_WIRE_LEN {
        return Err(CodecError::InvariantViolation(format!(
            "command of {} bytes exceeds {MAX_COMMAND_WIRE_LEN}-byte wire limit",
            p.command.trim().len()
        )));
    }
    finish(envelope_bytes(MessageType::Command, p)?)
}

pub fn serialize_response(p: &ResponsePayload) -> Result<Vec<u8>, CodecError> {
    check_response_invariant(p)?;
    finish(envelope_bytes(MessageType::Response, p)?)
}

pub fn serialize_error(p: &ErrorPayload) -> Result<Vec<u8>, CodecError> {
    finish(envelope_bytes(MessageType::Error, p)?)
}

pub fn serialize_heartbeat(p: &HeartbeatPayload) -> Result<Vec<u8>, CodecError> {
    finish(envelope_bytes(MessageType::Heartbeat, p)?)
}

fn envelope_bytes<T: serde::Serialize>(
    message_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    let outer = json!({
        "protocol_version": crate::envelope::PROTOCOL_VERSION,
        "message_type": message_type as u8,
        "payload": payload,
    });
    serde_json::to_vec(&outer).map_err(|e| CodecError::InvalidJson(e.to_string()))
}

/// Populates category and suggestion from the fixed tables; `details`
/// carries any extra machine-readable context for the failure.
pub fn make_error(
    request_id: Option<RequestId>,
    code: ErrorCode,
    message: impl Into<String>,
    details: Value,
) -> ErrorPayload {
    ErrorPayload {
        request_id,
        error_code: code.as_u32(),
        category: code.category() as u8,
        error_message: message.into(),
        suggestion: code.suggestion().to_owned(),
        details,
        timestamp: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestId;

    fn sample_command() -> CommandPayload {
        CommandPayload {
            request_id: RequestId::from("r1"),
            command: "lm".to_owned(),
            parameters: Value::Null,
            timeout_ms: 5000,
            timestamp: 0,
        }
    }

    #[test]
    fn command_round_trips() {
        let original = sample_command();
        let bytes = serialize_command(&original).unwrap();
        assert!(bytes.ends_with(DELIMITER));
        let Envelope { payload, .. } = parse_envelope(&bytes).unwrap();
        match payload {
            Payload::Command(p) => assert_eq!(p, original),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn response_round_trips() {
        let original = ResponsePayload {
            request_id: RequestId::from("r1"),
            success: true,
            output: "hello".to_owned(),
            error_message: String::new(),
            execution_time_ms: 42,
            session_data: None,
            timestamp: 123,
        };
        let bytes = serialize_response(&original).unwrap();
        let Envelope { payload, .. } = parse_envelope(&bytes).unwrap();
        match payload {
            Payload::Response(p) => assert_eq!(p, original),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn rejects_buffer_without_delimiter() {
        let buf = b"{\"protocol_version\":1}".to_vec();
        assert_eq!(parse_envelope(&buf), Err(CodecError::MissingDelimiter));
    }

    #[test]
    fn rejects_non_json() {
        let mut buf = b"not json".to_vec();
        buf.extend_from_slice(DELIMITER);
        assert!(matches!(parse_envelope(&buf), Err(CodecError::InvalidJson(_))));
    }

    #[test]
    fn rejects_oversized_message() {
        let buf = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        assert_eq!(parse_envelope(&buf), Err(CodecError::TooLarge(buf.len())));
    }

    #[test]
    fn size_boundary_is_inclusive_at_exactly_the_limit() {
        assert!(check_size(&vec![b'a'; MAX_MESSAGE_SIZE]).is_ok());
        assert_eq!(
            check_size(&vec![b'a'; MAX_MESSAGE_SIZE + 1]),
            Err(CodecError::TooLarge(MAX_MESSAGE_SIZE + 1))
        );
    }

    #[test]
    fn rejects_empty_buffer() {
        assert_eq!(check_size(&[]), Err(CodecError::TooLarge(0)));
    }

    #[test]
    fn accepts_message_at_exactly_the_size_limit() {
        // Build a command payload whose serialized envelope is exactly at the limit
        // by padding `parameters` with a filler string.
        let mut p = sample_command();
        let base_len = serialize_command(&p).unwrap().len();
        let pad_len = MAX_MESSAGE_SIZE - base_len;
        p.parameters = Value::String("x".repeat(pad_len.saturating_sub(12)));
        let bytes = serialize_command(&p).unwrap();
        assert!(bytes.len() <= MAX_MESSAGE_SIZE);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut buf = b"{\"protocol_version\":1,\"message_type\":9,\"payload\":{}}".to_vec();
        buf.extend_from_slice(DELIMITER);
        assert_eq!(parse_envelope(&buf), Err(CodecError::UnknownMessageType(9)));
    }

    #[test]
    fn response_invariant_rejects_success_with_error_message() {
        let bad = ResponsePayload {
            request_id: RequestId::from("r1"),
            success: true,
            output: String::new(),
            error_message: "oops".to_owned(),
            execution_time_ms: 0,
            session_data: None,
            timestamp: 0,
        };
        assert!(matches!(
            serialize_response(&bad),
            Err(CodecError::InvariantViolation(_))
        ));
    }

    #[test]
    fn find_message_end_ignores_partial_tail() {
        let mut buf = b"{}".to_vec();
        buf.extend_from_slice(DELIMITER);
        buf.extend_from_slice(b"{\"partial");
        let end = find_message_end(&buf).unwrap();
        assert_eq!(end, 6);
        assert_eq!(&buf[end..], b"{\"partial");
    }

    #[test]
    fn make_error_populates_category_and_suggestion() {
        let err = make_error(
            Some(RequestId::from("r1")),
            ErrorCode::Timeout,
            "timed out",
            Value::Null,
        );
        assert_eq!(err.error_code, 3);
        assert_eq!(err.category, ErrorCode::Timeout.category() as u8);
        assert_eq!(
            err.suggestion,
            "Increase timeout value or check if the target is responsive"
        );
    }

    #[test]
    fn command_over_wire_limit_is_rejected_on_serialize() {
        let mut p = sample_command();
        p.command = "a".repeat(MAX_COMMAND_WIRE_LEN + 1);
        assert!(matches!(
            serialize_command(&p),
            Err(CodecError::InvariantViolation(_))
        ));
    }

    #[test]
    fn command_over_wire_limit_is_rejected_on_parse() {
        // Construct the wire bytes directly, bypassing `serialize_command`'s own check.
        let mut p = sample_command();
        p.command = "a".repeat(MAX_COMMAND_WIRE_LEN + 1);
        let bytes = finish(envelope_bytes(MessageType::Command, &p).unwrap()).unwrap();
        assert!(matches!(
            parse_envelope(&bytes),
            Err(CodecError::InvariantViolation(_))
        ));
    }
}
