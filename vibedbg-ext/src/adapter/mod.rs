//! Component C: the debugger adapter seam.
//!
//! Exposes exactly the primitives the rest of the crate needs from the host
//! debugger. Every operation returns a result carrying a status; nothing
//! here raises. The core never names the host's native interface types —
//! callers only ever see `DebuggerAdapter`.

use std::time::Duration;

use crate::capture::OutputSink;

pub mod mock;

#[cfg(windows)]
pub mod windows_adapter;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("debugger call failed with HRESULT {0:#x}")]
    Hresult(u32),
    #[error("no current process")]
    NoCurrentProcess,
    #[error("no current thread")]
    NoCurrentThread,
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("memory access error at {address:#x}")]
    MemoryAccess { address: u64 },
    #[error("debugger adapter is not initialized")]
    NotInitialized,
    #[error("failed to initialize: no host debugger client available")]
    InitializationFailed,
}

/// The result of running one piece of debugger command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub raw_output: String,
    pub hresult: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub displacement: u64,
}

/// The seam to the host debugger. Implementations are free to use the
/// host's native interface set internally; this trait is all the rest of
/// the crate ever sees.
pub trait DebuggerAdapter: Send + Sync {
    fn execute_text_command(&self, text: &str, timeout: Duration) -> ExecResult;
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError>;
    fn resolve_symbol(&self, name: &str) -> Result<u64, AdapterError>;
    fn symbol_at(&self, addr: u64) -> Result<SymbolInfo, AdapterError>;
    fn current_pid(&self) -> Result<u32, AdapterError>;
    fn current_tid(&self) -> Result<u32, AdapterError>;
    fn current_process_name(&self) -> Result<String, AdapterError>;

    /// Installs `sink` as the debugger's text-output callback, returning
    /// whatever was previously installed (or `None`). Passing `None`
    /// uninstalls the current sink. This is the hook the capture sink's
    /// scoped-install helper uses.
    fn set_output_sink(&self, sink: Option<Box<dyn OutputSink>>) -> Option<Box<dyn OutputSink>>;
}
