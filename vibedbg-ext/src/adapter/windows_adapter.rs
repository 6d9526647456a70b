//! The real `DebuggerAdapter`: wraps DbgEng's COM interfaces
//! (`IDebugClient`, `IDebugControl`, `IDebugDataSpaces`, `IDebugRegisters`,
//! `IDebugSymbols`) behind the seam the rest of the crate depends on.
//!
//! DbgEng's engine is not reentrant across interfaces obtained from the same
//! client and expects to only be called from the thread that currently owns
//! the debug session. The command engine (component F) runs each invocation
//! on its own worker thread so it can honor a timeout, so every call here
//! goes through `Shared.lock()`: a single critical section stands in for
//! "only one thread talks to DbgEng at a time", the same role the routing
//! table entry's `Drop` in `libs/bin-shared` gives a single resource its own
//! narrow, explicitly-commented unsafe block.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use windows::core::{Interface, PCSTR, PCWSTR};
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    IDebugClient, IDebugControl, IDebugDataSpaces, IDebugOutputCallbacksWide,
    IDebugOutputCallbacksWide_Impl, IDebugRegisters, IDebugSymbols, DEBUG_EXECUTE_DEFAULT,
    DEBUG_OUTCTL_THIS_CLIENT,
};

use crate::capture::OutputSink;

use super::{AdapterError, DebuggerAdapter, ExecResult, SymbolInfo};

/// Bridges DbgEng's native output-callback interface to whichever
/// [`OutputSink`] the capture sink (component B) has currently installed via
/// [`WindowsAdapter::set_output_sink`]. Registered exactly once, at `bind`
/// time; individual commands swap `sink`'s contents rather than
/// re-registering a native callback per invocation.
#[windows_implement::implement(IDebugOutputCallbacksWide)]
struct OutputForwarder {
    sink: Arc<Mutex<Option<Box<dyn OutputSink>>>>,
}

impl IDebugOutputCallbacksWide_Impl for OutputForwarder_Impl {
    fn Output(&self, _mask: u32, text: &PCWSTR) -> windows_core::Result<()> {
        // Safety: `text` is a NUL-terminated wide string DbgEng owns for the
        // duration of this call only; we copy it out before returning.
        let text = unsafe { text.to_string() }.unwrap_or_default();
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.write(&text);
        }
        Ok(())
    }
}

/// The live DbgEng interface set, obtained once at extension load by
/// `QueryInterface`-ing the client DbgEng handed us in
/// `DebugExtensionInitialize`.
struct Interfaces {
    /// Kept alive for the lifetime of the derived sub-interfaces below; also
    /// the handle used to unregister the output callback on drop.
    client: IDebugClient,
    control: IDebugControl,
    data_spaces: IDebugDataSpaces,
    /// Acquired per the interface set the seam is specified to hold; no
    /// `DebuggerAdapter` method needs register access directly today since
    /// `r` reaches the engine as ordinary command text.
    #[allow(dead_code)]
    registers: IDebugRegisters,
    symbols: IDebugSymbols,
    /// Kept alive so the COM reference DbgEng holds via
    /// `SetOutputCallbacksWide` stays valid; never called on directly.
    #[allow(dead_code)]
    output_callbacks: IDebugOutputCallbacksWide,
}

// Safety: every call into these interfaces is made while holding
// `WindowsAdapter::lock`, so at most one thread ever touches DbgEng at a
// time, regardless of which worker thread `Arc<dyn DebuggerAdapter>` is
// cloned into.
unsafe impl Send for Interfaces {}
unsafe impl Sync for Interfaces {}

pub struct WindowsAdapter {
    inner: Mutex<Option<Interfaces>>,
    sink: Arc<Mutex<Option<Box<dyn OutputSink>>>>,
}

impl WindowsAdapter {
    /// Constructs an adapter with no bound interfaces yet. `DbgEng` hands an
    /// `IDebugClient` to command entry points, not to
    /// `DebugExtensionInitialize`, so `bind` attaches lazily from the first
    /// such command (`connect`, see `ffi.rs`); until then every method
    /// reports [`AdapterError::NotInitialized`].
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Derives the four sub-interfaces from `client` via `QueryInterface`,
    /// registers the output-forwarding callback (component B's native
    /// seam), and stores the set for the adapter's lifetime. Idempotent: a
    /// second call on an already-bound adapter is a no-op, since `connect`
    /// may re-invoke it with the client of a later command.
    pub fn bind(&self, client: IDebugClient) -> Result<(), AdapterError> {
        if self.inner.lock().is_some() {
            return Ok(());
        }

        let control: IDebugControl = client.cast().map_err(|e| AdapterError::Hresult(e.code().0 as u32))?;
        let data_spaces: IDebugDataSpaces = client.cast().map_err(|e| AdapterError::Hresult(e.code().0 as u32))?;
        let registers: IDebugRegisters = client.cast().map_err(|e| AdapterError::Hresult(e.code().0 as u32))?;
        let symbols: IDebugSymbols = client.cast().map_err(|e| AdapterError::Hresult(e.code().0 as u32))?;

        let forwarder = OutputForwarder { sink: Arc::clone(&self.sink) };
        let output_callbacks: IDebugOutputCallbacksWide = forwarder.into();
        // Safety: `output_callbacks` is kept alive for as long as `client`
        // via `Interfaces`, so the pointer DbgEng stores stays valid until
        // `WindowsAdapter` drops and unregisters it below.
        unsafe { client.SetOutputCallbacksWide(&output_callbacks) }
            .map_err(|e| AdapterError::Hresult(e.code().0 as u32))?;

        *self.inner.lock() = Some(Interfaces {
            client,
            control,
            data_spaces,
            registers,
            symbols,
            output_callbacks,
        });
        Ok(())
    }

    fn with_interfaces<T>(&self, f: impl FnOnce(&Interfaces) -> Result<T, AdapterError>) -> Result<T, AdapterError> {
        let guard = self.inner.lock();
        let interfaces = guard.as_ref().ok_or(AdapterError::NotInitialized)?;
        f(interfaces)
    }
}

impl Default for WindowsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WindowsAdapter {
    fn drop(&mut self) {
        if let Some(interfaces) = self.inner.lock().take() {
            // Safety: unregisters the callback before the `IDebugClient`
            // reference itself goes away; DbgEng holds no dangling pointer.
            let _ = unsafe { interfaces.client.SetOutputCallbacksWide(None) };
        }
    }
}

impl DebuggerAdapter for WindowsAdapter {
    fn execute_text_command(&self, text: &str, _timeout: Duration) -> ExecResult {
        let outcome = self.with_interfaces(|interfaces| {
            let command = std::ffi::CString::new(text).map_err(|_| AdapterError::Hresult(0))?;
            // Safety: `command` stays alive for the duration of the call;
            // `DEBUG_OUTCTL_THIS_CLIENT` routes output back through our own
            // registered callbacks rather than every attached client.
            let hr = unsafe {
                interfaces.control.Execute(
                    DEBUG_OUTCTL_THIS_CLIENT.0 as u32,
                    PCSTR(command.as_ptr() as *const u8),
                    DEBUG_EXECUTE_DEFAULT.0 as u32,
                )
            };
            Ok(hr)
        });

        match outcome {
            Ok(hr) => ExecResult {
                success: hr.is_ok(),
                raw_output: String::new(),
                hresult: hr.0,
            },
            Err(_) => ExecResult {
                success: false,
                raw_output: String::new(),
                hresult: -1,
            },
        }
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError> {
        self.with_interfaces(|interfaces| {
            let mut buffer = vec![0u8; len];
            let mut bytes_read = 0u32;
            // Safety: `buffer` is sized to `len` and `bytes_read` is a valid
            // out-param the call writes the actual count into.
            let hr = unsafe {
                interfaces
                    .data_spaces
                    .ReadVirtual(addr, buffer.as_mut_ptr() as *mut _, len as u32, Some(&mut bytes_read))
            };
            hr.ok().map_err(|_| AdapterError::MemoryAccess { address: addr })?;
            buffer.truncate(bytes_read as usize);
            Ok(buffer)
        })
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64, AdapterError> {
        self.with_interfaces(|interfaces| {
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let mut offset = 0u64;
            // Safety: `wide` is a NUL-terminated UTF-16 buffer kept alive
            // for the call's duration.
            let hr = unsafe { interfaces.symbols.GetOffsetByNameWide(PCWSTR(wide.as_ptr()), &mut offset) };
            hr.ok().map_err(|_| AdapterError::SymbolNotFound(name.to_owned()))?;
            Ok(offset)
        })
    }

    fn symbol_at(&self, addr: u64) -> Result<SymbolInfo, AdapterError> {
        self.with_interfaces(|interfaces| {
            let mut buffer = vec![0u16; 512];
            let mut name_size = 0u32;
            let mut displacement = 0u64;
            // Safety: `buffer` is sized generously for a symbol name;
            // `name_size` reports the actual length written.
            let hr = unsafe {
                interfaces.symbols.GetNameByOffsetWide(
                    addr,
                    pwstr_from(&mut buffer),
                    buffer.len() as u32,
                    Some(&mut name_size),
                    Some(&mut displacement),
                )
            };
            hr.ok().map_err(|_| AdapterError::SymbolNotFound(format!("{addr:#x}")))?;
            let name = String::from_utf16_lossy(&buffer[..name_size.saturating_sub(1) as usize]);
            Ok(SymbolInfo { name, displacement })
        })
    }

    fn current_pid(&self) -> Result<u32, AdapterError> {
        self.with_interfaces(|interfaces| {
            let mut pid = 0u32;
            // Safety: `pid` is a valid out-param pointer.
            let hr = unsafe { interfaces.symbols.GetCurrentProcessId(&mut pid) };
            hr.ok().map_err(|_| AdapterError::NoCurrentProcess)?;
            Ok(pid)
        })
    }

    fn current_tid(&self) -> Result<u32, AdapterError> {
        self.with_interfaces(|interfaces| {
            let mut tid = 0u32;
            // Safety: `tid` is a valid out-param pointer.
            let hr = unsafe { interfaces.symbols.GetCurrentThreadId(&mut tid) };
            hr.ok().map_err(|_| AdapterError::NoCurrentThread)?;
            Ok(tid)
        })
    }

    fn current_process_name(&self) -> Result<String, AdapterError> {
        self.with_interfaces(|interfaces| {
            let mut buffer = vec![0u8; 260];
            let mut size = 0u32;
            // Safety: `buffer` is a 260-byte (`MAX_PATH`) scratch buffer;
            // `size` reports the actual length written.
            let hr = unsafe {
                interfaces.symbols.GetImagePath(Some(&mut buffer), Some(&mut size))
            };
            hr.ok().map_err(|_| AdapterError::NoCurrentProcess)?;
            let end = size.saturating_sub(1) as usize;
            Ok(String::from_utf8_lossy(&buffer[..end.min(buffer.len())]).into_owned())
        })
    }

    fn set_output_sink(&self, sink: Option<Box<dyn OutputSink>>) -> Option<Box<dyn OutputSink>> {
        std::mem::replace(&mut self.sink.lock(), sink)
    }
}

/// `IDebugSymbols::GetNameByOffsetWide` wants a raw `PWSTR` out-buffer
/// rather than a slice, so this narrows the pointer cast to one line
/// instead of scattering it through the method body.
fn pwstr_from(buffer: &mut [u16]) -> windows::core::PWSTR {
    windows::core::PWSTR(buffer.as_mut_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_adapter_reports_not_initialized() {
        let adapter = WindowsAdapter::new();
        assert_eq!(adapter.current_pid(), Err(AdapterError::NotInitialized));
        assert_eq!(adapter.current_tid(), Err(AdapterError::NotInitialized));
        assert_eq!(adapter.resolve_symbol("foo"), Err(AdapterError::NotInitialized));
    }

    #[test]
    fn output_sink_swap_works_without_a_bound_client() {
        struct NullSink;
        impl OutputSink for NullSink {
            fn write(&self, _text: &str) {}
        }

        let adapter = WindowsAdapter::new();
        assert!(adapter.set_output_sink(Some(Box::new(NullSink))).is_none());
        assert!(adapter.set_output_sink(None).is_some());
    }
}
