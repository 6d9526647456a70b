//! Session-state entity shared by the store (component D) and the
//! `session_data` field carried on `Response` payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub image_path: String,
    pub attached: bool,
    /// Milliseconds since the epoch the session store uses; see `SessionSnapshot::session_start`.
    pub attach_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub tid: u32,
    pub pid: u32,
    pub is_current: bool,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub target_running: bool,
    pub session_start: i64,
    pub current_process: Option<ProcessInfo>,
    pub current_thread: Option<ThreadInfo>,
    #[serde(default)]
    pub metadata: Value,
}

/// A fixed, ordered list of common user-mode debugger primitives, returned
/// by the session store's `suggested_commands`.
pub fn suggested_commands() -> Vec<&'static str> {
    vec![
        "k",    // stack trace
        "r",    // registers
        "u",    // disassembly
        "db",   // memory display
        "~",    // thread list
        "lm",   // module list
        "bp",   // breakpoint set
        "g",    // continue
        "p",    // step-over
        "t",    // step-into
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_disconnected() {
        let snap = SessionSnapshot::default();
        assert!(!snap.connected);
        assert!(snap.current_process.is_none());
        assert!(snap.current_thread.is_none());
    }

    #[test]
    fn suggested_commands_is_stable_and_ordered() {
        let cmds = suggested_commands();
        assert_eq!(cmds.first(), Some(&"k"));
        assert!(cmds.contains(&"g"));
        assert_eq!(cmds.len(), 10);
    }
}
