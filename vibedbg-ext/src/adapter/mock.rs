//! A test double for `DebuggerAdapter`. Lets the engine, router, and pipe
//! server be exercised without a live debugger: it records every command it
//! was asked to run and returns scripted results.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::OutputSink;

use super::{AdapterError, DebuggerAdapter, ExecResult, SymbolInfo};

pub struct MockAdapter {
    calls: Mutex<Vec<String>>,
    scripted: Mutex<HashMap<String, ExecResult>>,
    default_result: Mutex<ExecResult>,
    pid: Mutex<Result<u32, AdapterError>>,
    tid: Mutex<Result<u32, AdapterError>>,
    process_name: Mutex<Result<String, AdapterError>>,
    sink: Mutex<Option<Box<dyn OutputSink>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            default_result: Mutex::new(ExecResult {
                success: true,
                raw_output: String::new(),
                hresult: 0,
            }),
            pid: Mutex::new(Ok(1234)),
            tid: Mutex::new(Ok(1)),
            process_name: Mutex::new(Ok("test.exe".to_owned())),
            sink: Mutex::new(None),
        }
    }

    /// Scripts the exact response for a given command string.
    pub fn script(&self, command: impl Into<String>, result: ExecResult) {
        self.scripted.lock().insert(command.into(), result);
    }

    pub fn set_default_result(&self, result: ExecResult) {
        *self.default_result.lock() = result;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn was_called(&self) -> bool {
        !self.calls.lock().is_empty()
    }

    /// Makes `current_pid` fail, simulating "no current process" so callers
    /// can exercise the session store's silent-sub-query-failure path.
    pub fn set_current_pid_err(&self) {
        *self.pid.lock() = Err(AdapterError::NoCurrentProcess);
    }

    pub fn set_current_tid_err(&self) {
        *self.tid.lock() = Err(AdapterError::NoCurrentThread);
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerAdapter for MockAdapter {
    fn execute_text_command(&self, text: &str, _timeout: Duration) -> ExecResult {
        self.calls.lock().push(text.to_owned());
        let result = self
            .scripted
            .lock()
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.default_result.lock().clone());

        if let Some(sink) = self.sink.lock().as_ref() {
            sink.write(&result.raw_output);
        }
        result
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError> {
        Ok(vec![0u8; len.min(4096)].into_iter().enumerate().map(|(i, _)| ((addr as usize + i) & 0xff) as u8).collect())
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64, AdapterError> {
        if name.is_empty() {
            return Err(AdapterError::SymbolNotFound(name.to_owned()));
        }
        Ok(0x1000)
    }

    fn symbol_at(&self, addr: u64) -> Result<SymbolInfo, AdapterError> {
        Ok(SymbolInfo {
            name: format!("sym_{addr:x}"),
            displacement: 0,
        })
    }

    fn current_pid(&self) -> Result<u32, AdapterError> {
        self.pid.lock().clone()
    }

    fn current_tid(&self) -> Result<u32, AdapterError> {
        self.tid.lock().clone()
    }

    fn current_process_name(&self) -> Result<String, AdapterError> {
        self.process_name.lock().clone()
    }

    fn set_output_sink(&self, sink: Option<Box<dyn OutputSink>>) -> Option<Box<dyn OutputSink>> {
        std::mem::replace(&mut self.sink.lock(), sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_every_call() {
        let adapter = MockAdapter::new();
        adapter.execute_text_command("lm", Duration::from_secs(1));
        adapter.execute_text_command("k", Duration::from_secs(1));
        assert_eq!(adapter.calls(), vec!["lm".to_owned(), "k".to_owned()]);
    }

    #[test]
    fn scripted_result_overrides_default() {
        let adapter = MockAdapter::new();
        adapter.script(
            "lm",
            ExecResult {
                success: true,
                raw_output: "module list".to_owned(),
                hresult: 0,
            },
        );
        let result = adapter.execute_text_command("lm", Duration::from_secs(1));
        assert_eq!(result.raw_output, "module list");
    }
}
