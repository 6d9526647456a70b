//! Raw named-pipe primitives underneath [`crate::server::PipeServer`].
//!
//! On Windows this is a thin wrapper over the Win32 pipe API, matching the
//! way the host debugger itself is reached — no async runtime, no tokio
//! pipe wrapper, just `CreateNamedPipeW`/`ConnectNamedPipe`/`PeekNamedPipe`/
//! `ReadFile`/`WriteFile` on blocking OS threads (§5). Off Windows there is
//! no native named-pipe client compatible with WinDbg, so this module
//! exposes an in-process loopback transport instead, enough to exercise the
//! framing and routing logic in `vibedbg-harness` on any platform.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("failed to create named pipe instance: {0}")]
    CreateFailed(String),
    #[error("failed to accept a client connection: {0}")]
    ConnectFailed(String),
    #[error("the pipe was closed by the peer")]
    BrokenPipe,
    #[error("the pipe is not connected")]
    NotConnected,
    #[error("no data available")]
    NoData,
    #[error("i/o error: {0}")]
    Io(String),
}

impl PipeError {
    /// `true` for conditions a worker should retry past; `false` for
    /// conditions that mean the connection is gone and the worker should
    /// exit without attempting to reply.
    pub fn is_recoverable_for_connection(&self) -> bool {
        !matches!(
            self,
            PipeError::BrokenPipe | PipeError::NotConnected | PipeError::CreateFailed(_)
        )
    }
}

#[cfg(windows)]
mod win {
    use super::PipeError;
    use std::ffi::c_void;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, WIN32_ERROR};
    use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile, PIPE_ACCESS_DUPLEX};
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PeekNamedPipe,
        NAMED_PIPE_MODE, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES,
        PIPE_WAIT,
    };

    pub struct RawPipe {
        handle: HANDLE,
    }

    // Safety: a `HANDLE` to a named pipe instance is only ever touched by
    // the single worker thread that owns this `RawPipe`.
    unsafe impl Send for RawPipe {}
    unsafe impl Sync for RawPipe {}

    fn encode_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn last_error_message(context: &str) -> String {
        let code = unsafe { GetLastError() };
        format!("{context} (GetLastError={})", code.0)
    }

    pub fn create_instance(pipe_name: &str, buffer_size: u32) -> Result<RawPipe, PipeError> {
        let wide = encode_wide(pipe_name);
        let mode = NAMED_PIPE_MODE(PIPE_TYPE_MESSAGE.0 | PIPE_READMODE_MESSAGE.0 | PIPE_WAIT.0);
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR(wide.as_ptr()),
                PIPE_ACCESS_DUPLEX,
                mode,
                PIPE_UNLIMITED_INSTANCES,
                buffer_size,
                buffer_size,
                0,
                None,
            )
        };
        match handle {
            Ok(handle) if !handle.is_invalid() => Ok(RawPipe { handle }),
            Ok(_) => Err(PipeError::CreateFailed(last_error_message("invalid handle"))),
            Err(e) => Err(PipeError::CreateFailed(e.to_string())),
        }
    }

    pub fn connect_blocking(pipe: &RawPipe) -> Result<(), PipeError> {
        unsafe { ConnectNamedPipe(pipe.handle, None) }
            .map_err(|e| PipeError::ConnectFailed(e.to_string()))
    }

    pub fn disconnect(pipe: &RawPipe) -> Result<(), PipeError> {
        unsafe { DisconnectNamedPipe(pipe.handle) }.map_err(|e| PipeError::Io(e.to_string()))?;
        unsafe { CloseHandle(pipe.handle) }.map_err(|e| PipeError::Io(e.to_string()))
    }

    pub fn peek_available(pipe: &RawPipe) -> Result<u32, PipeError> {
        let mut available: u32 = 0;
        let ok = unsafe {
            PeekNamedPipe(
                pipe.handle,
                None,
                0,
                None,
                Some(&mut available),
                None,
            )
        };
        match ok {
            Ok(()) => Ok(available),
            Err(_) => Err(classify_transport_error("PeekNamedPipe")),
        }
    }

    pub fn read_available(pipe: &RawPipe, available: u32, cap: u32) -> Result<Vec<u8>, PipeError> {
        let to_read = available.min(cap).max(1);
        let mut buf = vec![0u8; to_read as usize];
        let mut read: u32 = 0;
        let ok = unsafe {
            ReadFile(
                pipe.handle,
                Some(buf.as_mut_slice()),
                Some(&mut read),
                None,
            )
        };
        match ok {
            Ok(()) => {
                buf.truncate(read as usize);
                Ok(buf)
            }
            Err(_) => Err(classify_transport_error("ReadFile")),
        }
    }

    pub fn write_all(pipe: &RawPipe, data: &[u8]) -> Result<(), PipeError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let mut written: u32 = 0;
            let ok = unsafe {
                WriteFile(
                    pipe.handle,
                    Some(&data[offset..]),
                    Some(&mut written),
                    None,
                )
            };
            match ok {
                Ok(()) if written > 0 => offset += written as usize,
                Ok(()) => return Err(PipeError::Io("WriteFile wrote zero bytes".to_owned())),
                Err(_) => return Err(classify_transport_error("WriteFile")),
            }
        }
        Ok(())
    }

    fn classify_transport_error(context: &str) -> PipeError {
        const ERROR_BROKEN_PIPE: u32 = 109;
        const ERROR_NO_DATA: u32 = 232;
        const ERROR_PIPE_NOT_CONNECTED: u32 = 233;

        let code: WIN32_ERROR = unsafe { GetLastError() };
        match code.0 {
            ERROR_BROKEN_PIPE => PipeError::BrokenPipe,
            ERROR_PIPE_NOT_CONNECTED => PipeError::NotConnected,
            ERROR_NO_DATA => PipeError::NoData,
            other => PipeError::Io(format!("{context} failed (GetLastError={other})")),
        }
    }

    // Silence an unused-import warning when `c_void` ends up unused on some
    // toolchain/feature combinations.
    #[allow(dead_code)]
    fn _assert_c_void_referenced(_: *const c_void) {}
}

#[cfg(not(windows))]
mod loopback {
    use super::PipeError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};
    use std::time::{Duration, Instant};

    /// The two byte queues one named instance of a loopback pipe is made of.
    /// Named (not anonymous) so a [`TestClient`] opened by name finds the
    /// same instance a server created, the way Windows resolves multiple
    /// `CreateNamedPipeW` instances and one `CreateFileW` client open
    /// against the same kernel object name.
    struct Channel {
        to_server: Mutex<VecDeque<u8>>,
        to_client: Mutex<VecDeque<u8>>,
        connected: AtomicBool,
        /// Set by [`connect_test_client`], consumed by the one server-side
        /// instance whose `connect_blocking` claims it first. Keeps a
        /// multi-instance listener (which keeps calling `create_instance`
        /// while under `max_instances`) from spawning more than one worker
        /// against the same channel.
        pending_connect: AtomicBool,
    }

    impl Channel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                to_server: Mutex::new(VecDeque::new()),
                to_client: Mutex::new(VecDeque::new()),
                connected: AtomicBool::new(false),
                pending_connect: AtomicBool::new(false),
            })
        }
    }

    /// How long a loopback instance waits for a pending client before giving
    /// up and letting the listener loop re-check its shutdown flag. There is
    /// no real OS-level wait to interrupt here, so this bounds the latency
    /// of `PipeServer::stop` the same way `CREATE_RETRY_DELAY` bounds it on
    /// a real failed `CreateNamedPipeW`.
    const CONNECT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

    fn registry() -> &'static Mutex<HashMap<String, Arc<Channel>>> {
        static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Channel>>>> = OnceLock::new();
        REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
    }

    fn channel_for(pipe_name: &str) -> Arc<Channel> {
        Arc::clone(
            registry()
                .lock()
                .unwrap()
                .entry(pipe_name.to_owned())
                .or_insert_with(Channel::new),
        )
    }

    /// An in-process duplex byte queue standing in for a named pipe
    /// instance, so `vibedbg-harness` (and this crate's own tests) exercise
    /// the same server loop above the transport on non-Windows development
    /// machines.
    pub struct RawPipe {
        channel: Arc<Channel>,
    }

    pub fn create_instance(pipe_name: &str, _buffer_size: u32) -> Result<RawPipe, PipeError> {
        Ok(RawPipe {
            channel: channel_for(pipe_name),
        })
    }

    /// Blocks (polling) until a [`TestClient`] claims this instance via
    /// [`connect_test_client`], or `CONNECT_POLL_TIMEOUT` elapses. On
    /// timeout returns an error so the listener loop retries and re-checks
    /// its shutdown flag, rather than blocking this instance forever.
    pub fn connect_blocking(pipe: &RawPipe) -> Result<(), PipeError> {
        let deadline = Instant::now() + CONNECT_POLL_TIMEOUT;
        loop {
            if pipe
                .channel
                .pending_connect
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                pipe.channel.connected.store(true, Ordering::Release);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PipeError::ConnectFailed(
                    "no loopback client connected in time".to_owned(),
                ));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn disconnect(pipe: &RawPipe) -> Result<(), PipeError> {
        pipe.channel.connected.store(false, Ordering::Release);
        Ok(())
    }

    pub fn peek_available(pipe: &RawPipe) -> Result<u32, PipeError> {
        if !pipe.channel.connected.load(Ordering::Acquire) {
            return Err(PipeError::NotConnected);
        }
        Ok(pipe.channel.to_server.lock().unwrap().len() as u32)
    }

    pub fn read_available(pipe: &RawPipe, available: u32, cap: u32) -> Result<Vec<u8>, PipeError> {
        if !pipe.channel.connected.load(Ordering::Acquire) {
            return Err(PipeError::NotConnected);
        }
        let to_read = available.min(cap) as usize;
        let mut guard = pipe.channel.to_server.lock().unwrap();
        Ok(guard.drain(..to_read.min(guard.len())).collect())
    }

    pub fn write_all(pipe: &RawPipe, data: &[u8]) -> Result<(), PipeError> {
        if !pipe.channel.connected.load(Ordering::Acquire) {
            return Err(PipeError::NotConnected);
        }
        pipe.channel.to_client.lock().unwrap().extend(data.iter().copied());
        Ok(())
    }

    /// A test-only client handle onto a named loopback pipe, standing in for
    /// the out-of-process assistant that would open the real pipe with
    /// `CreateFileW` on Windows. Lets `vibedbg-ext/tests/` exercise
    /// [`crate::server::PipeServer`] end to end without a live debugger or a
    /// second process.
    pub struct TestClient {
        channel: Arc<Channel>,
    }

    /// Looks up (or creates) the named channel a server instance will also
    /// look up by the same name, the way a client `CreateFileW`s a pipe name
    /// a server has already registered with `CreateNamedPipeW`, and marks it
    /// pending so the next instance polling in `connect_blocking` claims it.
    pub fn connect_test_client(pipe_name: &str) -> TestClient {
        let channel = channel_for(pipe_name);
        channel.pending_connect.store(true, Ordering::Release);
        TestClient { channel }
    }

    impl TestClient {
        pub fn send(&self, data: &[u8]) {
            self.channel.to_server.lock().unwrap().extend(data.iter().copied());
        }

        /// Polls for at least one byte of server output until `timeout`
        /// elapses, then drains and returns whatever arrived. Returns an
        /// empty `Vec` on timeout rather than blocking forever, so a failed
        /// end-to-end test reports a clear assertion failure instead of
        /// hanging.
        pub fn recv_within(&self, timeout: Duration) -> Vec<u8> {
            let deadline = Instant::now() + timeout;
            loop {
                {
                    let mut guard = self.channel.to_client.lock().unwrap();
                    if !guard.is_empty() {
                        return guard.drain(..).collect();
                    }
                }
                if Instant::now() >= deadline {
                    return Vec::new();
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

#[cfg(windows)]
pub use win::*;

#[cfg(not(windows))]
pub use loopback::*;
