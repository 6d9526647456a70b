//! End-to-end test of [`PipeServer`] against the loopback transport: a
//! [`TestClient`] opens the same named channel the server listens on,
//! writes a framed `Command` message, and reads back a framed `Response`.
//!
//! Loopback-only: there is no real named-pipe client on non-Windows, so this
//! file is gated off the Windows build the same way `pipe_io`'s loopback
//! module is.

#![cfg(not(windows))]

use std::sync::Arc;
use std::time::Duration;

use vibedbg_ext::adapter::mock::MockAdapter;
use vibedbg_ext::adapter::{DebuggerAdapter, ExecResult};
use vibedbg_ext::pipe_io::connect_test_client;
use vibedbg_ext::{CommandEngine, PipeServer, ServerConfig, SessionStore};
use vibedbg_protocol::codec;
use vibedbg_protocol::envelope::{CommandPayload, Envelope, Payload, RequestId};

fn unique_pipe_name(tag: &str) -> String {
    format!(r"\\.\pipe\vibedbg_test_{tag}_{}", std::process::id())
}

fn start_server(pipe_name: &str, adapter: Arc<dyn DebuggerAdapter>) -> PipeServer {
    let session = Arc::new(SessionStore::new());
    let engine = Arc::new(CommandEngine::new(Arc::clone(&adapter), Arc::clone(&session)));

    let handler = Arc::new(move |command: CommandPayload| {
        let result = engine.execute(&command.command, Default::default());
        let snapshot = session.get_snapshot(adapter.as_ref());
        vibedbg_protocol::envelope::ResponsePayload {
            request_id: command.request_id,
            success: result.success,
            output: result.output,
            error_message: result.error_message,
            execution_time_ms: result.execution_time.as_millis() as u32,
            session_data: serde_json::to_value(&snapshot).ok(),
            timestamp: result.timestamp,
        }
    });

    let server = PipeServer::new(
        ServerConfig {
            pipe_name: pipe_name.to_owned(),
            ..ServerConfig::default()
        },
        handler,
        None,
    );
    server.start().expect("pipe server failed to start");
    server
}

#[test]
fn a_command_sent_over_the_pipe_gets_a_matching_response() {
    let pipe_name = unique_pipe_name("roundtrip");
    let adapter = Arc::new(MockAdapter::new());
    adapter.script(
        "lm",
        ExecResult {
            success: true,
            raw_output: "module list".to_owned(),
            hresult: 0,
        },
    );
    let server = start_server(&pipe_name, adapter.clone() as Arc<dyn DebuggerAdapter>);

    let client = connect_test_client(&pipe_name);
    let request_id = RequestId::from("req-1");
    let request = CommandPayload {
        request_id: request_id.clone(),
        command: "lm".to_owned(),
        parameters: serde_json::Value::Null,
        timeout_ms: 5000,
        timestamp: 0,
    };
    client.send(&codec::serialize_command(&request).unwrap());

    let raw_response = client.recv_within(Duration::from_secs(5));
    assert!(!raw_response.is_empty(), "server never responded");

    let Envelope { payload, .. } = codec::parse_envelope(&raw_response).unwrap();
    match payload {
        Payload::Response(response) => {
            assert_eq!(response.request_id, request_id);
            assert!(response.success);
            assert_eq!(response.output, "module list");
        }
        other => panic!("expected a Response payload, got {other:?}"),
    }

    assert!(adapter.was_called());
    server.stop();
}

#[test]
fn a_dangerous_command_is_rejected_without_reaching_the_adapter() {
    let pipe_name = unique_pipe_name("denylist");
    let adapter = Arc::new(MockAdapter::new());
    let server = start_server(&pipe_name, adapter.clone() as Arc<dyn DebuggerAdapter>);

    let client = connect_test_client(&pipe_name);
    let request = CommandPayload {
        request_id: RequestId::from("req-2"),
        command: ".reboot".to_owned(),
        parameters: serde_json::Value::Null,
        timeout_ms: 5000,
        timestamp: 0,
    };
    client.send(&codec::serialize_command(&request).unwrap());

    let raw_response = client.recv_within(Duration::from_secs(5));
    assert!(!raw_response.is_empty(), "server never responded");

    let Envelope { payload, .. } = codec::parse_envelope(&raw_response).unwrap();
    match payload {
        Payload::Response(response) => {
            assert!(!response.success);
            assert!(response.error_message.contains("unsafe"));
        }
        other => panic!("expected a Response payload, got {other:?}"),
    }

    assert!(!adapter.was_called(), "the denylist should have short-circuited before the adapter");
    server.stop();
}

#[test]
fn two_commands_in_one_write_are_both_framed_and_answered() {
    let pipe_name = unique_pipe_name("pipelined");
    let adapter = Arc::new(MockAdapter::new());
    let server = start_server(&pipe_name, adapter.clone() as Arc<dyn DebuggerAdapter>);

    let client = connect_test_client(&pipe_name);
    let first = CommandPayload {
        request_id: RequestId::from("req-a"),
        command: "k".to_owned(),
        parameters: serde_json::Value::Null,
        timeout_ms: 5000,
        timestamp: 0,
    };
    let second = CommandPayload {
        request_id: RequestId::from("req-b"),
        command: "r".to_owned(),
        parameters: serde_json::Value::Null,
        timeout_ms: 5000,
        timestamp: 0,
    };
    let mut batch = codec::serialize_command(&first).unwrap();
    batch.extend(codec::serialize_command(&second).unwrap());
    client.send(&batch);

    let mut seen_ids = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while seen_ids.len() < 2 && std::time::Instant::now() < deadline {
        let chunk = client.recv_within(Duration::from_secs(5));
        let mut offset = 0;
        while let Some(end) = codec::find_message_end(&chunk[offset..]) {
            let Envelope { payload, .. } = codec::parse_envelope(&chunk[offset..offset + end]).unwrap();
            if let Payload::Response(response) = payload {
                seen_ids.push(response.request_id);
            }
            offset += end;
        }
    }

    seen_ids.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(seen_ids, vec![RequestId::from("req-a"), RequestId::from("req-b")]);
    server.stop();
}
