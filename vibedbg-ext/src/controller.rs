//! Component I: the extension controller.
//!
//! A process-wide singleton owning every other component's lifetime, built
//! in dependency order (adapter → session → engine → pipe server) and torn
//! down in the reverse order. `DebugExtensionInitialize`/
//! `DebugExtensionUninitialize` (in `ffi.rs`) are the only callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde_json::json;

use vibedbg_protocol::envelope::ResponsePayload;

use crate::adapter::DebuggerAdapter;
use crate::config::ExtensionConfig;
use crate::engine::{CommandEngine, EngineOptions};
use crate::server::{Handler, HeartbeatProvider, PipeServer};
use crate::session::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("the extension controller is already initialized")]
    AlreadyInitialized,
    #[error("the extension controller has not been initialized")]
    NotInitialized,
    #[error("failed to start the pipe server: {0}")]
    ServerStart(#[from] crate::pipe_io::PipeError),
}

/// Everything the controller owns, built once and torn down together. Not
/// `pub`: callers only ever reach it through [`Controller`]'s methods.
struct Components {
    adapter: Arc<dyn DebuggerAdapter>,
    session: Arc<SessionStore>,
    engine: Arc<CommandEngine>,
    server: PipeServer,
    engine_options: EngineOptions,
}

/// The process-wide controller instance. A WinDbg extension DLL is loaded
/// once per debugger process, so one `OnceLock` per loaded module is exactly
/// the lifetime DbgEng expects.
static CONTROLLER: OnceLock<Controller> = OnceLock::new();

pub struct Controller {
    components: Mutex<Option<Components>>,
    initialized: AtomicBool,
}

impl Controller {
    fn empty() -> Self {
        Self {
            components: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns the process-wide instance, creating it (uninitialized) on
    /// first access.
    pub fn global() -> &'static Controller {
        CONTROLLER.get_or_init(Controller::empty)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Builds every component in dependency order and starts the pipe
    /// server. Idempotent: a second call while already initialized returns
    /// [`ControllerError::AlreadyInitialized`] rather than rebuilding.
    pub fn initialize(&self, adapter: Arc<dyn DebuggerAdapter>, config: ExtensionConfig) -> Result<(), ControllerError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(ControllerError::AlreadyInitialized);
        }

        let session = Arc::new(SessionStore::new());
        let engine = Arc::new(CommandEngine::new(Arc::clone(&adapter), Arc::clone(&session)));

        let handler: Handler = make_handler(
            Arc::clone(&engine),
            Arc::clone(&session),
            Arc::clone(&adapter),
            config.engine_options,
        );
        let heartbeat: Option<HeartbeatProvider> = Some(make_heartbeat_provider(Arc::clone(&session), Arc::clone(&adapter)));
        let server = PipeServer::new(config.server.clone(), handler, heartbeat);
        server.start().map_err(|e| {
            self.initialized.store(false, Ordering::Release);
            e
        })?;

        *self.components.lock() = Some(Components {
            adapter,
            session,
            engine,
            server,
            engine_options: config.engine_options,
        });

        Ok(())
    }

    /// Stops the pipe server and drops every component, in the reverse of
    /// initialization order. Idempotent.
    pub fn uninitialize(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(components) = self.components.lock().take() {
            components.server.stop();
            // `engine`/`session`/`adapter` drop here, in reverse
            // construction order, as the `Components` struct's fields do.
        }
    }

    /// Runs one command through the engine directly — the path used by the
    /// `execute` FFI entry point when a caller is already inside the
    /// debugger's command thread rather than going over the pipe.
    pub fn execute(&self, command: &str) -> Result<crate::engine::CommandResult, ControllerError> {
        let guard = self.components.lock();
        let components = guard.as_ref().ok_or(ControllerError::NotInitialized)?;
        Ok(components.engine.execute(command, components.engine_options))
    }

    pub fn status(&self) -> Option<ControllerStatus> {
        let guard = self.components.lock();
        let components = guard.as_ref()?;
        Some(ControllerStatus {
            initialized: true,
            active_connections: components.server.active_connection_count(),
            engine_stats: components.engine.stats(),
            session: components.session.get_snapshot(components.adapter.as_ref()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub initialized: bool,
    pub active_connections: usize,
    pub engine_stats: crate::engine::EngineStatsSnapshot,
    pub session: vibedbg_protocol::SessionSnapshot,
}

/// Builds the pipe server's handler: looks up the current session snapshot,
/// runs the command through the engine, and folds both into one
/// `ResponsePayload` (§3's `session_data` field).
fn make_handler(
    engine: Arc<CommandEngine>,
    session: Arc<SessionStore>,
    adapter: Arc<dyn DebuggerAdapter>,
    options: EngineOptions,
) -> Handler {
    Arc::new(move |command| {
        let timeout_override = if command.timeout_ms > 0 {
            Some(std::time::Duration::from_millis(command.timeout_ms as u64))
        } else {
            options.timeout
        };
        let per_request_options = EngineOptions {
            timeout: timeout_override,
            ..options
        };
        let result = engine.execute(&command.command, per_request_options);
        let snapshot = session.get_snapshot(adapter.as_ref());
        ResponsePayload {
            request_id: command.request_id.clone(),
            success: result.success,
            output: result.output,
            error_message: result.error_message,
            execution_time_ms: result.execution_time.as_millis() as u32,
            session_data: serde_json::to_value(&snapshot).ok(),
            timestamp: result.timestamp,
        }
    })
}

fn make_heartbeat_provider(session: Arc<SessionStore>, adapter: Arc<dyn DebuggerAdapter>) -> HeartbeatProvider {
    Arc::new(move || {
        let snapshot = session.get_snapshot(adapter.as_ref());
        json!({
            "connected": snapshot.connected,
            "target_running": snapshot.target_running,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::server::ServerConfig;

    fn test_config() -> ExtensionConfig {
        ExtensionConfig {
            server: ServerConfig {
                pipe_name: format!(r"\\.\pipe\vibedbg_test_{}", std::process::id()),
                ..ServerConfig::default()
            },
            ..ExtensionConfig::default()
        }
    }

    #[test]
    fn execute_before_initialize_is_not_initialized() {
        let controller = Controller::empty();
        assert!(!controller.is_initialized());
        assert!(matches!(
            controller.execute("k"),
            Err(ControllerError::NotInitialized)
        ));
    }

    #[test]
    fn double_initialize_is_rejected() {
        let controller = Controller::empty();
        let adapter: Arc<dyn DebuggerAdapter> = Arc::new(MockAdapter::new());
        controller.initialize(adapter.clone(), test_config()).unwrap();
        assert!(matches!(
            controller.initialize(adapter, test_config()),
            Err(ControllerError::AlreadyInitialized)
        ));
        controller.uninitialize();
    }

    #[test]
    fn uninitialize_is_idempotent() {
        let controller = Controller::empty();
        controller.uninitialize();
        controller.uninitialize();
        assert!(!controller.is_initialized());
    }

    #[test]
    fn execute_after_initialize_runs_through_the_engine() {
        let controller = Controller::empty();
        let adapter = Arc::new(MockAdapter::new());
        adapter.script(
            "lm",
            crate::adapter::ExecResult {
                success: true,
                raw_output: "modules".to_owned(),
                hresult: 0,
            },
        );
        controller
            .initialize(adapter.clone() as Arc<dyn DebuggerAdapter>, test_config())
            .unwrap();
        let result = controller.execute("lm").unwrap();
        assert!(result.success);
        assert_eq!(result.output, "modules");
        controller.uninitialize();
    }

    #[test]
    fn status_reports_session_and_engine_stats() {
        let controller = Controller::empty();
        let adapter: Arc<dyn DebuggerAdapter> = Arc::new(MockAdapter::new());
        controller.initialize(adapter, test_config()).unwrap();
        controller.execute("lm").unwrap();
        let status = controller.status().unwrap();
        assert!(status.initialized);
        assert_eq!(status.engine_stats.total, 1);
        assert!(status.session.connected);
        controller.uninitialize();
    }
}
