//! The host-command surface (§6): the six DbgEng extension-command entry
//! points (`connect`, `disconnect`, `status`, `execute`, `version`, `help`)
//! plus `DebugExtensionInitialize`/`DebugExtensionUninitialize`.
//!
//! DbgEng's real ABI only ever hands `DebugExtensionInitialize` a
//! version/flags pair, never an `IDebugClient` — the client only shows up at
//! the first command invocation. So `DebugExtensionInitialize` just prepares
//! logging and an unbound `WindowsAdapter`; `connect` is what binds that
//! adapter to the client it's handed and runs component I's full ordered
//! init (steps 1-5). `disconnect`/`DebugExtensionUninitialize` tear the
//! controller back down; the bound adapter itself outlives that, ready to
//! be reused by a later `connect`.
//!
//! Every exported function here has the DbgEng extension-command signature
//! `(client: PDEBUG_CLIENT, args: PCSTR) -> HRESULT`. The bodies are kept to
//! argument marshalling and a call into [`crate::controller::Controller`];
//! all the logic worth unit-testing — text formatting, argument parsing —
//! lives in free functions below that take no COM types, the way
//! `continuum_core`'s `ffi/mod.rs` keeps its exported `extern "C"` shims thin
//! around plain-Rust logic.

use crate::controller::{Controller, ControllerStatus};
use crate::engine::CommandResult;

/// Printed by the `help` host command.
pub const HELP_TEXT: &str = "\
vibedbg commands:
  !connect    - start the IPC pipe server for the AI assistant
  !disconnect - stop the IPC pipe server
  !status     - show session state, connection count, and engine stats
  !execute <command> - run a debugger command through the engine
  !version    - print the extension version
  !help       - show this text";

pub fn format_version_text() -> String {
    format!("vibedbg extension v{}", env!("CARGO_PKG_VERSION"))
}

pub fn format_connect_text(already_running: bool, pipe_name: &str) -> String {
    if already_running {
        format!("vibedbg is already listening on {pipe_name}")
    } else {
        format!("vibedbg is now listening on {pipe_name}")
    }
}

pub fn format_disconnect_text(was_running: bool) -> String {
    if was_running {
        "vibedbg IPC server stopped".to_owned()
    } else {
        "vibedbg IPC server was not running".to_owned()
    }
}

pub fn format_status_text(status: Option<&ControllerStatus>) -> String {
    let Some(status) = status else {
        return "vibedbg is not initialized".to_owned();
    };
    let stats = &status.engine_stats;
    format!(
        "vibedbg status:\n  \
         connected: {}\n  \
         active pipe connections: {}\n  \
         commands: {} total, {} ok, {} failed, {} timed out\n  \
         current process: {}",
        status.session.connected,
        status.active_connections,
        stats.total,
        stats.successful,
        stats.failed,
        stats.timed_out,
        status
            .session
            .current_process
            .as_ref()
            .map(|p| format!("{} (pid {})", p.name, p.pid))
            .unwrap_or_else(|| "none".to_owned()),
    )
}

pub fn format_execute_text(result: &CommandResult) -> String {
    if result.success {
        result.output.clone()
    } else {
        format!("Error: {}", result.error_message)
    }
}

/// `execute`'s single argument is the free-form debugger command; unlike the
/// other five host commands it takes no sub-parsing beyond trimming.
pub fn parse_execute_args(args: &str) -> Result<&str, &'static str> {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        Err("Error: !execute requires a command, e.g. '!execute lm'")
    } else {
        Ok(trimmed)
    }
}

#[cfg(windows)]
mod windows_entry {
    use std::mem::ManuallyDrop;
    use std::sync::{Arc, OnceLock};

    use windows::core::{Interface, PCSTR};
    use windows::Win32::Foundation::{E_FAIL, HRESULT, S_OK};
    use windows::Win32::System::Diagnostics::Debug::Extensions::IDebugClient;

    use super::*;
    use crate::adapter::windows_adapter::WindowsAdapter;
    use crate::adapter::{AdapterError, DebuggerAdapter};
    use crate::config::ExtensionConfig;

    type PDebugClient = *mut core::ffi::c_void;

    /// The process-wide adapter instance. Kept as a concrete `WindowsAdapter`
    /// (not the `Arc<dyn DebuggerAdapter>` the controller stores) so `connect`
    /// can call `bind`, which is specific to this adapter and not part of the
    /// cross-platform `DebuggerAdapter` seam.
    static ADAPTER: OnceLock<Arc<WindowsAdapter>> = OnceLock::new();

    fn adapter() -> &'static Arc<WindowsAdapter> {
        ADAPTER.get_or_init(|| Arc::new(WindowsAdapter::new()))
    }

    /// Borrows (never frees) the `IDebugClient` the host passed us: the
    /// extension does not own this reference's lifetime, the host does.
    unsafe fn borrow_client(client: PDebugClient) -> ManuallyDrop<IDebugClient> {
        ManuallyDrop::new(IDebugClient::from_raw(client))
    }

    /// Reads a host-supplied `PCSTR` argument string, treating a null
    /// pointer as an empty string rather than propagating a panic across
    /// the FFI boundary.
    unsafe fn read_args(args: PCSTR) -> String {
        if args.is_null() {
            return String::new();
        }
        args.to_string().unwrap_or_default()
    }

    fn print_line(client: &IDebugClient, text: &str) {
        // Safety: `client` was handed to us by the host for the duration of
        // this call; `IDebugControl::Output` is the host's documented way
        // of writing to its console from an extension command.
        if let Ok(control) = client.cast::<windows::Win32::System::Diagnostics::Debug::Extensions::IDebugControl>() {
            let mut line = text.to_owned();
            line.push('\n');
            let wide: Vec<u16> = line.encode_utf16().chain(std::iter::once(0)).collect();
            unsafe {
                let _ = control.OutputWide(
                    windows::Win32::System::Diagnostics::Debug::Extensions::DEBUG_OUTPUT_NORMAL,
                    windows::core::PCWSTR(wide.as_ptr()),
                );
            }
        }
    }

    /// Rejects a null client before doing anything else: DbgEng's own
    /// "bind to the host debugger client" step (component I, step 1) fails
    /// with [`AdapterError::InitializationFailed`] when there is none, and a
    /// null client is the only way that can happen on this ABI.
    fn run(client: PDebugClient, args: PCSTR, body: impl FnOnce(&IDebugClient, String)) -> HRESULT {
        if client.is_null() {
            tracing::error!(error = %AdapterError::InitializationFailed, "host command invoked with no debugger client");
            return E_FAIL;
        }

        let guard = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            let client = borrow_client(client);
            let text = read_args(args);
            body(&client, text);
        }));
        match guard {
            Ok(()) => S_OK,
            Err(_) => E_FAIL,
        }
    }

    /// `DebugExtensionInitialize`: the DLL entry point DbgEng calls once on
    /// load. Only sets up logging and the (still unbound) adapter — DbgEng
    /// gives this function no `IDebugClient`, so component I's init proper
    /// happens later, from `connect`. `*version`/`*flags` follow the DbgEng
    /// ABI convention: low word major, high word minor; flags unused.
    ///
    /// # Safety
    /// `version` and `flags` must be valid, writable `u32` pointers, per the
    /// DbgEng extension-loading contract.
    #[no_mangle]
    pub unsafe extern "system" fn DebugExtensionInitialize(version: *mut u32, flags: *mut u32) -> HRESULT {
        if !version.is_null() {
            *version = 1;
        }
        if !flags.is_null() {
            *flags = 0;
        }

        let config = ExtensionConfig::from_env();
        let _ = crate::logging::init(&config.log_filter);
        let _ = adapter();

        S_OK
    }

    /// `DebugExtensionUninitialize`: torn down in the reverse order (pipe
    /// server, then engine, then session, then adapter sub-interfaces).
    #[no_mangle]
    pub extern "system" fn DebugExtensionUninitialize() {
        Controller::global().uninitialize();
    }

    /// Binds the adapter to `client` (a no-op if already bound) and, unless
    /// the controller is already running, performs component I's ordered
    /// init (session → engine → pipe server, started last) and starts
    /// listening for the AI assistant.
    ///
    /// # Safety
    /// `client` and `args` must be valid for the duration of this call, per
    /// the DbgEng extension-command ABI.
    #[no_mangle]
    pub unsafe extern "system" fn connect(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, _args| {
            let config = ExtensionConfig::from_env();

            if Controller::global().is_initialized() {
                print_line(client, &format_connect_text(true, &config.server.pipe_name));
                return;
            }

            if let Err(error) = adapter().bind(client.clone()) {
                print_line(client, &format!("Error: failed to bind to the debugger client: {error}"));
                return;
            }

            let pipe_name = config.server.pipe_name.clone();
            match Controller::global().initialize(Arc::clone(adapter()) as Arc<dyn DebuggerAdapter>, config) {
                Ok(()) => print_line(client, &format_connect_text(false, &pipe_name)),
                Err(error) => print_line(client, &format!("Error: failed to start vibedbg: {error}")),
            }
        })
    }

    /// # Safety
    /// Same contract as [`connect`].
    #[no_mangle]
    pub unsafe extern "system" fn disconnect(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, _args| {
            let was_running = Controller::global().is_initialized();
            Controller::global().uninitialize();
            print_line(client, &format_disconnect_text(was_running));
        })
    }

    /// # Safety
    /// Same contract as [`connect`].
    #[no_mangle]
    pub unsafe extern "system" fn status(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, _args| {
            let status = Controller::global().status();
            print_line(client, &format_status_text(status.as_ref()));
        })
    }

    /// # Safety
    /// Same contract as [`connect`].
    #[no_mangle]
    pub unsafe extern "system" fn execute(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, text| match parse_execute_args(&text) {
            Ok(command) => match Controller::global().execute(command) {
                Ok(result) => print_line(client, &format_execute_text(&result)),
                Err(error) => print_line(client, &format!("Error: {error}")),
            },
            Err(message) => print_line(client, message),
        })
    }

    /// # Safety
    /// Same contract as [`connect`].
    #[no_mangle]
    pub unsafe extern "system" fn version(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, _args| {
            print_line(client, &format_version_text());
        })
    }

    /// # Safety
    /// Same contract as [`connect`].
    #[no_mangle]
    pub unsafe extern "system" fn help(client: PDebugClient, args: PCSTR) -> HRESULT {
        run(client, args, |client, _args| {
            print_line(client, HELP_TEXT);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CommandResult;
    use std::time::Duration;

    #[test]
    fn help_text_lists_all_six_host_commands() {
        for name in ["connect", "disconnect", "status", "execute", "version", "help"] {
            assert!(HELP_TEXT.contains(name), "missing {name} in help text");
        }
    }

    #[test]
    fn version_text_embeds_the_crate_version() {
        assert!(format_version_text().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn execute_args_rejects_empty_command() {
        assert!(parse_execute_args("   ").is_err());
    }

    #[test]
    fn execute_args_trims_whitespace() {
        assert_eq!(parse_execute_args("  lm  ").unwrap(), "lm");
    }

    #[test]
    fn status_text_reports_uninitialized_when_none() {
        assert_eq!(format_status_text(None), "vibedbg is not initialized");
    }

    #[test]
    fn execute_text_prefixes_errors() {
        let failed = CommandResult {
            success: false,
            output: String::new(),
            error_message: "boom".to_owned(),
            execution_time: Duration::ZERO,
            command_executed: "x".to_owned(),
            timestamp: 0,
        };
        assert_eq!(format_execute_text(&failed), "Error: boom");
    }

    #[test]
    fn connect_text_distinguishes_already_running() {
        assert!(format_connect_text(true, r"\\.\pipe\x").contains("already"));
        assert!(!format_connect_text(false, r"\\.\pipe\x").contains("already"));
    }
}

#[cfg(windows)]
pub use windows_entry::{connect, disconnect, execute, help, status, version, DebugExtensionInitialize, DebugExtensionUninitialize};
