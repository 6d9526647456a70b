//! Wire envelope, typed payloads, and error taxonomy for the vibedbg IPC
//! channel between the debugger extension and an out-of-process assistant.
//!
//! This crate has no I/O and no threads: it is shared, inert data plus
//! (de)serialization, usable from both the pipe server and any client.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod session;

pub use codec::{CodecError, DELIMITER, MAX_COMMAND_WIRE_LEN, MAX_MESSAGE_SIZE};
pub use envelope::{
    CommandPayload, Envelope, ErrorPayload, HeartbeatPayload, MessageType, Payload, RequestId,
    ResponsePayload, PROTOCOL_VERSION,
};
pub use error::{ErrorCategory, ErrorCode};
pub use session::{ProcessInfo, SessionSnapshot, ThreadInfo};
