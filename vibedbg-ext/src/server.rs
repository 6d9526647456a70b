//! Component H: the multi-instance named-pipe server.
//!
//! One listener thread repeatedly creates a pipe instance and blocks until
//! a client connects; each accepted connection gets its own worker thread.
//! Workers never share buffers. The connection list and statistics are
//! shared state, guarded by a reader-writer lock and a stats mutex
//! respectively (§5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use vibedbg_protocol::codec::{self, DELIMITER, MAX_MESSAGE_SIZE};
use vibedbg_protocol::envelope::{CommandPayload, Payload, ResponsePayload};

use crate::pipe_io::{self, PipeError, RawPipe};

/// Invoked once per parsed `Command` message; the server itself never
/// interprets command text, only frames and routes bytes to this closure.
pub type Handler = Arc<dyn Fn(CommandPayload) -> ResponsePayload + Send + Sync>;

/// Supplies the JSON `session_info` body for periodic heartbeat messages.
/// `None` disables heartbeats even if `config.heartbeat_interval` is set.
pub type HeartbeatProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pipe_name: String,
    pub max_instances: u32,
    pub buffer_size: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pipe_name: default_pipe_name(),
            max_instances: 10,
            buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: None,
        }
    }
}

pub fn default_pipe_name() -> String {
    r"\\.\pipe\vibedbg_debug".to_owned()
}

/// How often a worker polls `PeekNamedPipe` for new bytes when idle.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long `CreateNamedPipeW` backs off after a transient failure.
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub msgs_recv: u64,
    pub msgs_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
}

struct Connection {
    id: String,
    pipe: RawPipe,
    active: AtomicBool,
    stats: Mutex<ConnectionStats>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

fn new_connection_id(counter: &AtomicU64) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{n}")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
}

struct ServerStatsInner {
    total_connections: u64,
}

/// Component H. Owns the listener thread and the connection list; stopping
/// is idempotent and joins every worker before returning.
pub struct PipeServer {
    config: ServerConfig,
    handler: Handler,
    heartbeat: Option<HeartbeatProvider>,
    running: Arc<AtomicBool>,
    connections: Arc<RwLock<Vec<Arc<Connection>>>>,
    connection_counter: Arc<AtomicU64>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<ServerStatsInner>>,
}

impl PipeServer {
    pub fn new(config: ServerConfig, handler: Handler, heartbeat: Option<HeartbeatProvider>) -> Self {
        Self {
            config,
            handler,
            heartbeat,
            running: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(RwLock::new(Vec::new())),
            connection_counter: Arc::new(AtomicU64::new(0)),
            listener: Mutex::new(None),
            stats: Arc::new(Mutex::new(ServerStatsInner { total_connections: 0 })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .count()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections: self.stats.lock().total_connections,
            active_connections: self.active_connection_count(),
        }
    }

    /// Starts the listener thread. Idempotent: calling `start` while
    /// already running is a no-op.
    pub fn start(&self) -> Result<(), PipeError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let heartbeat = self.heartbeat.clone();
        let running = Arc::clone(&self.running);
        let connections = Arc::clone(&self.connections);
        let connection_counter = Arc::clone(&self.connection_counter);
        let stats = Arc::clone(&self.stats);

        let listener = std::thread::Builder::new()
            .name("vibedbg-pipe-listener".to_owned())
            .spawn(move || {
                listener_loop(
                    config,
                    handler,
                    heartbeat,
                    running,
                    connections,
                    connection_counter,
                    stats,
                );
            })
            .expect("failed to spawn pipe listener thread");

        *self.listener.lock() = Some(listener);
        Ok(())
    }

    /// Stops the listener, disconnects and closes every connection, and
    /// joins all worker threads. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            let _ = listener.join();
        }

        let mut connections = self.connections.write();
        for conn in connections.drain(..) {
            conn.active.store(false, Ordering::Release);
            let _ = pipe_io::disconnect(&conn.pipe);
        }
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listener_loop(
    config: ServerConfig,
    handler: Handler,
    heartbeat: Option<HeartbeatProvider>,
    running: Arc<AtomicBool>,
    connections: Arc<RwLock<Vec<Arc<Connection>>>>,
    connection_counter: Arc<AtomicU64>,
    stats: Arc<Mutex<ServerStatsInner>>,
) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while running.load(Ordering::Acquire) {
        let active = connections
            .read()
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .count();
        if active >= config.max_instances as usize {
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        let pipe = match pipe_io::create_instance(&config.pipe_name, config.buffer_size) {
            Ok(pipe) => pipe,
            Err(error) => {
                tracing::warn!(%error, "failed to create named pipe instance, retrying");
                std::thread::sleep(CREATE_RETRY_DELAY);
                continue;
            }
        };

        match pipe_io::connect_blocking(&pipe) {
            Ok(()) => {}
            Err(_) if !running.load(Ordering::Acquire) => break,
            Err(error) => {
                tracing::warn!(%error, "failed to accept named pipe connection, retrying");
                continue;
            }
        }

        let conn = Arc::new(Connection {
            id: new_connection_id(&connection_counter),
            pipe,
            active: AtomicBool::new(true),
            stats: Mutex::new(ConnectionStats::default()),
            last_activity: Mutex::new(Instant::now()),
        });
        tracing::info!(connection_id = %conn.id, "accepted pipe client");
        stats.lock().total_connections += 1;
        connections.write().push(Arc::clone(&conn));

        let worker_config = config.clone();
        let worker_handler = Arc::clone(&handler);
        let worker_heartbeat = heartbeat.clone();
        let worker_running = Arc::clone(&running);
        let worker_conn = Arc::clone(&conn);
        let handle = std::thread::Builder::new()
            .name(format!("vibedbg-pipe-worker-{}", conn.id))
            .spawn(move || worker_loop(worker_conn, worker_handler, worker_heartbeat, worker_config, worker_running))
            .expect("failed to spawn pipe worker thread");
        workers.push(handle);
    }

    for handle in workers {
        let _ = handle.join();
    }
}

fn worker_loop(
    conn: Arc<Connection>,
    handler: Handler,
    heartbeat: Option<HeartbeatProvider>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
) {
    let mut buffer: VecDeque<u8> = VecDeque::new();
    let mut last_heartbeat = Instant::now();

    while conn.active.load(Ordering::Acquire) && running.load(Ordering::Acquire) {
        match pipe_io::peek_available(&conn.pipe) {
            Ok(0) => {
                std::thread::sleep(POLL_INTERVAL);
                maybe_send_heartbeat(&conn, &heartbeat, &config, &mut last_heartbeat);
                continue;
            }
            Ok(available) => match pipe_io::read_available(&conn.pipe, available, config.buffer_size) {
                Ok(chunk) => {
                    conn.stats.lock().bytes_recv += chunk.len() as u64;
                    buffer.extend(chunk);
                }
                Err(error) if !error.is_recoverable_for_connection() => {
                    tracing::info!(connection_id = %conn.id, %error, "connection lost");
                    break;
                }
                Err(error) => {
                    tracing::warn!(connection_id = %conn.id, %error, "transient read error");
                    continue;
                }
            },
            Err(error) if !error.is_recoverable_for_connection() => {
                tracing::info!(connection_id = %conn.id, %error, "connection lost while polling");
                break;
            }
            Err(error) => {
                tracing::warn!(connection_id = %conn.id, %error, "transient peek error");
                continue;
            }
        }

        while let Some(response_bytes) = drain_one_message(&mut buffer, &conn, &handler) {
            conn.touch();
            conn.stats.lock().bytes_sent += response_bytes.len() as u64;
            conn.stats.lock().msgs_sent += 1;
            if let Err(error) = pipe_io::write_all(&conn.pipe, &response_bytes) {
                tracing::info!(connection_id = %conn.id, %error, "write failed, dropping connection");
                conn.active.store(false, Ordering::Release);
                break;
            }
        }
    }

    conn.active.store(false, Ordering::Release);
}

/// Pulls one complete, delimiter-terminated message off the front of
/// `buffer` (advancing past it, keeping any tail for next time), dispatches
/// it, and returns the serialized response bytes — or `None` if `buffer`
/// doesn't yet contain a whole message.
fn drain_one_message(buffer: &mut VecDeque<u8>, conn: &Connection, handler: &Handler) -> Option<Vec<u8>> {
    let contiguous: Vec<u8> = buffer.iter().copied().collect();
    if contiguous.len() > MAX_MESSAGE_SIZE {
        // Oversized: drop everything we have and let the codec reject it
        // as `InvalidMessage` rather than growing the buffer unbounded.
        let response = error_response("unknown", "message exceeds the maximum size");
        buffer.clear();
        return Some(response);
    }

    let end = codec::find_message_end(&contiguous)?;
    let raw = contiguous[..end].to_vec();
    for _ in 0..end {
        buffer.pop_front();
    }

    conn.stats.lock().msgs_recv += 1;

    let response_payload = match codec::parse_envelope(&raw) {
        Ok(envelope) => match envelope.payload {
            Payload::Command(cmd) => handler(cmd),
            _ => ResponsePayload {
                request_id: "unknown".into(),
                success: false,
                output: String::new(),
                error_message: "expected a Command message".to_owned(),
                execution_time_ms: 0,
                session_data: None,
                timestamp: 0,
            },
        },
        Err(error) => {
            return Some(error_response("unknown", &error.to_string()));
        }
    };

    Some(codec::serialize_response(&response_payload).unwrap_or_else(|_| {
        error_response("unknown", "failed to serialize response")
    }))
}

fn error_response(request_id: &str, message: &str) -> Vec<u8> {
    let payload = ResponsePayload {
        request_id: request_id.into(),
        success: false,
        output: String::new(),
        error_message: message.to_owned(),
        execution_time_ms: 0,
        session_data: None,
        timestamp: 0,
    };
    codec::serialize_response(&payload).unwrap_or_else(|_| {
        let mut fallback = br#"{"protocol_version":1,"message_type":2,"payload":{"request_id":"unknown","success":false,"output":"","error_message":"internal codec error","execution_time_ms":0,"timestamp":0}}"#.to_vec();
        fallback.extend_from_slice(DELIMITER);
        fallback
    })
}

fn maybe_send_heartbeat(
    conn: &Connection,
    heartbeat: &Option<HeartbeatProvider>,
    config: &ServerConfig,
    last_heartbeat: &mut Instant,
) {
    let (Some(interval), Some(provider)) = (config.heartbeat_interval, heartbeat.as_ref()) else {
        return;
    };
    if last_heartbeat.elapsed() < interval {
        return;
    }
    *last_heartbeat = Instant::now();

    let payload = vibedbg_protocol::envelope::HeartbeatPayload {
        session_info: provider(),
        timestamp: 0,
    };
    if let Ok(bytes) = codec::serialize_heartbeat(&payload) {
        if pipe_io::write_all(&conn.pipe, &bytes).is_err() {
            conn.active.store(false, Ordering::Release);
        }
    }
}
