//! Component D: the session-state store.
//!
//! Multi-reader, single-writer: readers take a shared lock, the lazy-init
//! writer takes exclusive. Initialization of the sub-queries (current
//! process / thread) may fail silently — the store is still considered
//! initialized and the corresponding optional fields simply stay empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use vibedbg_protocol::{ProcessInfo, SessionSnapshot, ThreadInfo};

use crate::adapter::DebuggerAdapter;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Component D. Holds the `SessionSnapshot` entity shared between the
/// engine (reads it before every command) and the controller (surfaces it
/// on `Response::session_data`).
pub struct SessionStore {
    state: RwLock<SessionSnapshot>,
    initialized: AtomicBool,
}

impl SessionStore {
    /// Construction only — no adapter query happens here. Querying the
    /// current process/thread is deferred to the first read, to avoid the
    /// circular init the spec warns about (the debugger may not yet have a
    /// current process at controller-construction time).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionSnapshot::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns the current snapshot, triggering lazy initialization against
    /// `adapter` on the first call.
    pub fn get_snapshot(&self, adapter: &dyn DebuggerAdapter) -> SessionSnapshot {
        self.ensure_initialized(adapter);
        self.state.read().clone()
    }

    fn ensure_initialized(&self, adapter: &dyn DebuggerAdapter) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.write();
        // Re-check under the exclusive lock: another reader may have raced us here.
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        state.connected = true;
        state.session_start = now_millis();
        state.current_process = adapter.current_pid().ok().map(|pid| ProcessInfo {
            pid,
            name: adapter.current_process_name().unwrap_or_default(),
            image_path: String::new(),
            attached: true,
            attach_time: state.session_start,
        });
        state.current_thread = adapter.current_tid().ok().map(|tid| ThreadInfo {
            tid,
            pid: state.current_process.as_ref().map_or(0, |p| p.pid),
            is_current: true,
            state: "running".to_owned(),
        });
        state.target_running = state.current_process.is_some();

        self.initialized.store(true, Ordering::Release);
    }

    /// Overwrites the stored snapshot wholesale. The sole writer besides
    /// lazy-init.
    pub fn update(&self, new: SessionSnapshot) {
        *self.state.write() = new;
        self.initialized.store(true, Ordering::Release);
    }

    /// Re-points `current_thread` at `tid`, re-querying the adapter for the
    /// owning process. Leaves the rest of the snapshot untouched.
    pub fn switch_to_thread(&self, tid: u32, adapter: &dyn DebuggerAdapter) {
        self.ensure_initialized(adapter);
        let mut state = self.state.write();
        let pid = state.current_process.as_ref().map_or(0, |p| p.pid);
        state.current_thread = Some(ThreadInfo {
            tid,
            pid,
            is_current: true,
            state: "running".to_owned(),
        });
    }

    /// A fixed, ordered list of common user-mode debugger primitives.
    pub fn suggested_commands(&self) -> Vec<&'static str> {
        vibedbg_protocol::session::suggested_commands()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;

    #[test]
    fn lazy_initializes_on_first_read() {
        let adapter = MockAdapter::new();
        let store = SessionStore::new();
        assert!(!store.initialized.load(Ordering::Acquire));

        let snap = store.get_snapshot(&adapter);
        assert!(snap.connected);
        assert_eq!(snap.current_process.as_ref().unwrap().pid, 1234);
        assert_eq!(snap.current_thread.as_ref().unwrap().tid, 1);
    }

    #[test]
    fn missing_process_leaves_optional_fields_empty_but_initialized() {
        let adapter = MockAdapter::new();
        adapter.set_current_pid_err();
        let store = SessionStore::new();

        let snap = store.get_snapshot(&adapter);
        assert!(snap.connected);
        assert!(snap.current_process.is_none());
        assert!(store.initialized.load(Ordering::Acquire));
    }

    #[test]
    fn switch_to_thread_updates_only_the_thread() {
        let adapter = MockAdapter::new();
        let store = SessionStore::new();
        store.get_snapshot(&adapter);

        store.switch_to_thread(99, &adapter);
        let snap = store.get_snapshot(&adapter);
        assert_eq!(snap.current_thread.as_ref().unwrap().tid, 99);
        assert_eq!(snap.current_process.as_ref().unwrap().pid, 1234);
    }

    #[test]
    fn suggested_commands_matches_the_protocol_crates_fixed_list() {
        let store = SessionStore::new();
        assert_eq!(
            store.suggested_commands(),
            vibedbg_protocol::session::suggested_commands()
        );
    }
}
