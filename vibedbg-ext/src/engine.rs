//! Component F: the command execution engine.
//!
//! Normalizes, routes (component G), validates, and runs one command (or a
//! batch of them) against the debugger adapter, synchronously or on a
//! small fixed worker pool, tracking running statistics throughout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::adapter::DebuggerAdapter;
use crate::capture::{CaptureSink, OutputSink, ScopedCapture};
use crate::router::{self, RouteResult};
use crate::session::SessionStore;

/// The engine's own length cap, distinct from the wire's 4096-byte cap —
/// this is what `options.validate` enforces on the text actually handed to
/// the adapter.
pub const MAX_COMMAND_LEN: usize = 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Long-running command prefixes (`g`, `!analyze`) default to this instead.
pub const LONG_RUNNING_TIMEOUT: Duration = Duration::from_secs(60);

const ENGINE_WORKER_COUNT: usize = 2;

/// Dangerous-command denylist (§4.F). Checked against the lower-cased,
/// trimmed command when `options.validate` is set and the command did not
/// come from the router (routed typed dispatches bypass this — see
/// DESIGN.md).
const DANGEROUS_PREFIXES: &[&str] = &[
    "ed ", "eb ", "ew ", "eq ", // memory-write
    ".reboot", ".crash",        // system control
    "!process 0 7",             // system-stalling query
    ".detach", ".kill",         // destructive process control
    "sxe", "sxd",               // exception-handling changes
];

/// Filesystem-destructive tokens the sanitizer rejects unconditionally.
const SANITIZED_TOKENS: &[&str] = &["rm ", "del "];

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn is_dangerous(lowered: &str) -> bool {
    DANGEROUS_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

fn is_sanitized(lowered: &str) -> bool {
    SANITIZED_TOKENS.iter().any(|t| lowered.contains(t))
}

fn default_timeout_for(lowered: &str) -> Duration {
    let head = lowered.split_whitespace().next().unwrap_or("");
    if head == "g" || head == "!analyze" {
        LONG_RUNNING_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub validate: bool,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            validate: true,
            timeout: None,
            retry_count: 0,
            retry_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error_message: String,
    pub execution_time: Duration,
    pub command_executed: String,
    pub timestamp: i64,
}

impl CommandResult {
    fn rejected(command: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            output: String::new(),
            error_message: message,
            execution_time: Duration::ZERO,
            command_executed: command.to_owned(),
            timestamp: now_millis(),
        }
    }
}

pub struct BatchResult {
    pub results: Vec<CommandResult>,
    pub successful: usize,
    pub failed: usize,
    pub total_time: Duration,
    pub all_ok: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StatsInner {
    total: u64,
    successful: u64,
    failed: u64,
    timed_out: u64,
    total_execution_time_ms: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub total_execution_time: Duration,
}

impl EngineStatsSnapshot {
    pub fn average_execution_time(&self) -> Duration {
        if self.total == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.total as u32
        }
    }
}

/// A handle to a task submitted via [`Shared::execute_async`]. Resolves
/// once the worker pool has run the task; waiting past the timeout the
/// caller chooses does not cancel the in-flight work (§5, cooperative
/// cancellation).
pub struct AsyncHandle {
    rx: mpsc::Receiver<CommandResult>,
}

impl AsyncHandle {
    pub fn wait(self) -> Option<CommandResult> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<CommandResult> {
        self.rx.recv_timeout(timeout).ok()
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Outcome of one adapter invocation, enforced against `timeout` from the
/// *caller's* side: the adapter has no native cancellation, so the worker
/// thread running it may outlive the task if it never returns.
enum SingleOutcome {
    Done(CommandResult),
    TimedOut,
}

struct Shared {
    adapter: Arc<dyn DebuggerAdapter>,
    session: Arc<SessionStore>,
    stats: Mutex<StatsInner>,
    queue: StdMutex<VecDeque<Task>>,
    queue_cv: Condvar,
    shutdown: AtomicBool,
}

struct ArcSink(Arc<CaptureSink>);

impl OutputSink for ArcSink {
    fn write(&self, text: &str) {
        self.0.write(text);
    }
}

impl Shared {
    /// Normalizes, routes, and runs `raw` per the router's decision.
    fn execute(&self, raw: &str, options: EngineOptions) -> CommandResult {
        let trimmed_original = raw.trim();
        let normalized = trimmed_original.to_lowercase();

        match router::route(&normalized, trimmed_original) {
            RouteResult::ArgumentError(message) => CommandResult {
                success: false,
                output: message.clone(),
                error_message: message,
                execution_time: Duration::ZERO,
                command_executed: trimmed_original.to_owned(),
                timestamp: now_millis(),
            },
            RouteResult::Dispatch(text) => self.execute_single(&text, options, true),
            RouteResult::PassThrough => self.execute_single(trimmed_original, options, false),
            RouteResult::Composite(steps) => self.execute_composite(&steps, options),
        }
    }

    fn execute_composite(
        &self,
        steps: &[(&'static str, String)],
        options: EngineOptions,
    ) -> CommandResult {
        let start = Instant::now();
        let mut combined = String::new();
        let mut all_success = true;

        for (label, text) in steps {
            let result = self.execute_single(text, options, true);
            combined.push_str(&format!("=== {label} ===\n"));
            combined.push_str(&result.output);
            if !result.output.ends_with('\n') {
                combined.push('\n');
            }
            if !result.success {
                all_success = false;
                combined.push_str(&format!("(error: {})\n", result.error_message));
            }
        }

        CommandResult {
            success: all_success,
            output: combined,
            error_message: if all_success {
                String::new()
            } else {
                "one or more deadlock-analysis steps failed".to_owned()
            },
            execution_time: start.elapsed(),
            command_executed: "!deadlock".to_owned(),
            timestamp: now_millis(),
        }
    }

    /// The synchronous path (§4.F steps 1-6): validate, sanitize, snapshot
    /// the session, capture output around one adapter call, record stats.
    fn execute_single(
        &self,
        command: &str,
        options: EngineOptions,
        bypass_denylist: bool,
    ) -> CommandResult {
        let trimmed = command.trim();
        let lowered = trimmed.to_lowercase();

        if options.validate {
            if trimmed.is_empty() {
                return self.record(CommandResult::rejected(trimmed, "Invalid command: command is empty"), false);
            }
            if trimmed.len() > MAX_COMMAND_LEN {
                return self.record(
                    CommandResult::rejected(
                        trimmed,
                        format!("Invalid command: exceeds {MAX_COMMAND_LEN}-byte limit"),
                    ),
                    false,
                );
            }
            if !bypass_denylist && is_dangerous(&lowered) {
                return self.record(
                    CommandResult::rejected(
                        trimmed,
                        format!("Invalid command: '{trimmed}' is unsafe and has been blocked"),
                    ),
                    false,
                );
            }
        }

        if is_sanitized(&lowered) {
            return self.record(
                CommandResult::rejected(
                    trimmed,
                    "Invalid command: contains a disallowed filesystem token",
                ),
                false,
            );
        }

        let timeout = options.timeout.unwrap_or_else(|| default_timeout_for(&lowered));
        let mut attempt = 0;
        loop {
            match self.run_once(trimmed, timeout) {
                SingleOutcome::Done(result) => return self.record(result, false),
                SingleOutcome::TimedOut => {
                    if attempt >= options.retry_count {
                        let result = CommandResult {
                            success: false,
                            output: String::new(),
                            error_message: format!("Command timed out after {timeout:?}"),
                            execution_time: timeout,
                            command_executed: trimmed.to_owned(),
                            timestamp: now_millis(),
                        };
                        return self.record(result, true);
                    }
                    attempt += 1;
                    std::thread::sleep(options.retry_delay);
                }
            }
        }
    }

    /// Runs one adapter call on its own thread and waits on a channel
    /// bounded by `timeout`, rather than trusting the adapter call itself
    /// to respect it (the source's timeout-ignoring bug the spec calls
    /// out as fixed here).
    fn run_once(&self, command: &str, timeout: Duration) -> SingleOutcome {
        self.session.get_snapshot(self.adapter.as_ref());

        let adapter = Arc::clone(&self.adapter);
        let command_owned = command.to_owned();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();

        std::thread::spawn(move || {
            let sink = Arc::new(CaptureSink::new());
            let _capture = ScopedCapture::install(adapter.as_ref(), Box::new(ArcSink(Arc::clone(&sink))));
            let exec = adapter.execute_text_command(&command_owned, timeout);
            let output = sink.take();
            let _ = tx.send((exec, output));
        });

        match rx.recv_timeout(timeout) {
            Ok((exec, output)) => SingleOutcome::Done(CommandResult {
                success: exec.success,
                output: if exec.success { output } else { String::new() },
                error_message: if exec.success {
                    String::new()
                } else if output.is_empty() {
                    format!("command failed with HRESULT {:#x}", exec.hresult)
                } else {
                    output
                },
                execution_time: start.elapsed(),
                command_executed: command.to_owned(),
                timestamp: now_millis(),
            }),
            Err(_) => SingleOutcome::TimedOut,
        }
    }

    fn record(&self, result: CommandResult, timed_out: bool) -> CommandResult {
        let mut stats = self.stats.lock();
        stats.total += 1;
        if timed_out {
            stats.timed_out += 1;
            stats.failed += 1;
        } else if result.success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        stats.total_execution_time_ms += result.execution_time.as_millis() as u64;
        result
    }

    fn enqueue(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.queue_cv.notify_one();
    }
}

fn spawn_worker(idx: usize, shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("vibedbg-engine-{idx}"))
        .spawn(move || loop {
            let mut queue = shared.queue.lock().unwrap();
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared.queue_cv.wait(queue).unwrap();
            }
            let task = queue.pop_front();
            drop(queue);
            match task {
                Some(task) => task(),
                None => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn engine worker thread")
}

/// Component F. Owns a fixed two-thread worker pool and a task queue;
/// workers are created at construction and joined on drop.
pub struct CommandEngine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandEngine {
    pub fn new(adapter: Arc<dyn DebuggerAdapter>, session: Arc<SessionStore>) -> Self {
        let shared = Arc::new(Shared {
            adapter,
            session,
            stats: Mutex::new(StatsInner::default()),
            queue: StdMutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..ENGINE_WORKER_COUNT)
            .map(|i| spawn_worker(i, Arc::clone(&shared)))
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn execute(&self, raw: &str, options: EngineOptions) -> CommandResult {
        self.shared.execute(raw, options)
    }

    /// Submits `raw` to the worker pool; the returned handle resolves once
    /// a worker picks it up and runs it.
    pub fn execute_async(&self, raw: String, options: EngineOptions) -> AsyncHandle {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        self.shared.enqueue(Box::new(move || {
            let result = shared.execute(&raw, options);
            let _ = tx.send(result);
        }));
        AsyncHandle { rx }
    }

    /// Clears not-yet-started tasks. Does not interrupt in-flight work.
    pub fn cancel_all_pending(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Runs `commands` in order on the calling thread, invoking `progress`
    /// after each. Failures do not abort the batch.
    pub fn execute_batch(
        &self,
        commands: &[String],
        options: EngineOptions,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> BatchResult {
        let start = Instant::now();
        let mut results = Vec::with_capacity(commands.len());
        let mut successful = 0;
        let mut failed = 0;

        for (i, command) in commands.iter().enumerate() {
            let result = self.shared.execute(command, options);
            if result.success {
                successful += 1;
            } else {
                failed += 1;
            }
            results.push(result);
            if let Some(cb) = progress.as_deref_mut() {
                cb(i + 1, commands.len());
            }
        }

        BatchResult {
            successful,
            failed,
            all_ok: failed == 0,
            total_time: start.elapsed(),
            results,
        }
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let s = self.shared.stats.lock();
        EngineStatsSnapshot {
            total: s.total,
            successful: s.successful,
            failed: s.failed,
            timed_out: s.timed_out,
            total_execution_time: Duration::from_millis(s.total_execution_time_ms),
        }
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::adapter::ExecResult;
    use std::time::Duration as StdDuration;

    fn engine_with_mock() -> (CommandEngine, Arc<MockAdapter>) {
        let adapter = Arc::new(MockAdapter::new());
        let session = Arc::new(SessionStore::new());
        let engine = CommandEngine::new(adapter.clone(), session);
        (engine, adapter)
    }

    #[test]
    fn empty_command_is_rejected_without_calling_adapter() {
        let (engine, adapter) = engine_with_mock();
        let result = engine.execute("   ", EngineOptions::default());
        assert!(!result.success);
        assert!(!adapter.was_called());
    }

    #[test]
    fn command_exactly_at_length_cap_is_accepted() {
        let (engine, adapter) = engine_with_mock();
        adapter.script("?", ExecResult { success: true, raw_output: "ok".to_owned(), hresult: 0 });
        // Pass through (unknown command) so it reaches the adapter unmodified.
        let cmd = format!("?{}", "a".repeat(MAX_COMMAND_LEN - 1));
        let result = engine.execute(&cmd, EngineOptions::default());
        assert!(adapter.was_called());
        let _ = result;
    }

    #[test]
    fn command_over_length_cap_is_rejected() {
        let (engine, adapter) = engine_with_mock();
        let cmd = "a".repeat(MAX_COMMAND_LEN + 1);
        let result = engine.execute(&cmd, EngineOptions::default());
        assert!(!result.success);
        assert!(!adapter.was_called());
    }

    #[test]
    fn dangerous_commands_are_rejected_without_invoking_adapter() {
        let (engine, adapter) = engine_with_mock();
        for cmd in ["ed 0x1000 0x41", ".reboot", ".crash", "!process 0 7", "sxe av"] {
            let result = engine.execute(cmd, EngineOptions::default());
            assert!(!result.success, "expected {cmd} to be rejected");
        }
        assert!(!adapter.was_called());
    }

    #[test]
    fn rm_and_del_tokens_are_sanitized_regardless_of_validate_flag() {
        let (engine, adapter) = engine_with_mock();
        let mut options = EngineOptions::default();
        options.validate = false;
        let result = engine.execute("!foo rm -rf /", options);
        assert!(!result.success);
        assert!(!adapter.was_called());
    }

    #[test]
    fn routed_detach_bypasses_the_denylist() {
        let (engine, adapter) = engine_with_mock();
        adapter.script(
            ".detach",
            ExecResult { success: true, raw_output: "detached".to_owned(), hresult: 0 },
        );
        let result = engine.execute(".detach", EngineOptions::default());
        assert!(result.success);
        assert!(adapter.was_called());
    }

    #[test]
    fn malformed_router_argument_never_reaches_the_adapter() {
        let (engine, adapter) = engine_with_mock();
        let result = engine.execute("bc abc", EngineOptions::default());
        assert!(result.error_message.starts_with("Error:"));
        assert!(result.error_message.contains("abc"));
        assert!(!adapter.was_called());
    }

    #[test]
    fn happy_path_returns_adapter_output() {
        let (engine, adapter) = engine_with_mock();
        adapter.script("lm", ExecResult { success: true, raw_output: "module list".to_owned(), hresult: 0 });
        let result = engine.execute("lm", EngineOptions::default());
        assert!(result.success);
        assert_eq!(result.output, "module list");
        assert_eq!(adapter.calls(), vec!["lm".to_owned()]);
    }

    #[test]
    fn stats_total_equals_successful_plus_failed() {
        let (engine, adapter) = engine_with_mock();
        adapter.script("lm", ExecResult { success: true, raw_output: "ok".to_owned(), hresult: 0 });
        engine.execute("lm", EngineOptions::default());
        engine.execute("", EngineOptions::default());
        let stats = engine.stats();
        assert_eq!(stats.total, stats.successful + stats.failed);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn async_execution_resolves_via_the_worker_pool() {
        let (engine, adapter) = engine_with_mock();
        adapter.script("lm", ExecResult { success: true, raw_output: "ok".to_owned(), hresult: 0 });
        let handle = engine.execute_async("lm".to_owned(), EngineOptions::default());
        let result = handle.wait_timeout(StdDuration::from_secs(5)).expect("async task should complete");
        assert!(result.success);
    }

    #[test]
    fn batch_does_not_abort_on_failure() {
        let (engine, adapter) = engine_with_mock();
        adapter.script("lm", ExecResult { success: true, raw_output: "ok".to_owned(), hresult: 0 });
        let commands = vec!["lm".to_owned(), "".to_owned(), "lm".to_owned()];
        let batch = engine.execute_batch(&commands, EngineOptions::default(), None);
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.successful, 2);
        assert_eq!(batch.failed, 1);
        assert!(!batch.all_ok);
    }

    #[test]
    fn deadlock_composite_concatenates_four_labeled_sections() {
        let (engine, adapter) = engine_with_mock();
        adapter.set_default_result(ExecResult { success: true, raw_output: "x".to_owned(), hresult: 0 });
        let result = engine.execute("!deadlock", EngineOptions::default());
        assert!(result.success);
        assert!(result.output.contains("=== threads ==="));
        assert!(result.output.contains("=== all thread stacks ==="));
        assert!(result.output.contains("=== locks ==="));
        assert!(result.output.contains("=== critical sections ==="));
        assert_eq!(adapter.calls().len(), 4);
    }
}
