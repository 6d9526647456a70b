//! Component B: the output capture sink.
//!
//! Installed as the debugger's text-output callback for the duration of one
//! command invocation, via a scoped acquire/install/restore helper rather
//! than a self-reference-counted callback object (see the REDESIGN FLAGS
//! note on "callback-based output capture" in the spec).

use parking_lot::Mutex;

use crate::adapter::DebuggerAdapter;

/// Maximum number of bytes a single capture will accumulate before it stops
/// appending and marks itself truncated.
pub const MAX_CAPTURE_BYTES: usize = 1_048_576;

pub const TRUNCATION_SENTINEL: &str = "[Output truncated - maximum size exceeded]";

const CACHE_WARNING_NEEDLE: &str = ".cache forcedecodeuser is not enabled";
const GALLERY_COMMAND_NEEDLE: &str = "is not extension gallery command";
const NO_EXPORT_NEEDLE: &str = "No export";
const FOUND_NEEDLE: &str = "found";

/// Anything that can receive chunks of debugger output text. This is the
/// Rust-side stand-in for the debugger's native output-callback interface;
/// the core never names the native type.
pub trait OutputSink: Send + Sync {
    fn write(&self, text: &str);
}

#[derive(Default)]
struct CaptureState {
    text: String,
    truncated: bool,
    classified_cache_warning: bool,
    classified_gallery_command: bool,
    classified_no_export: bool,
}

/// Accumulates output for a single debugger-command invocation. Scoped to
/// that invocation: never shared across commands.
pub struct CaptureSink {
    state: Mutex<CaptureState>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CaptureState::default()),
        }
    }

    /// Returns everything captured so far, classification already applied.
    pub fn take(&self) -> String {
        std::mem::take(&mut self.state.lock().text)
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for CaptureSink {
    fn write(&self, chunk: &str) {
        let mut state = self.state.lock();
        if state.truncated {
            return;
        }

        let rewritten = classify(chunk, &mut state);

        if state.text.len() + rewritten.len() > MAX_CAPTURE_BYTES {
            state.text.push_str(TRUNCATION_SENTINEL);
            state.text.push('\n');
            state.truncated = true;
            return;
        }
        state.text.push_str(&rewritten);
    }
}

/// Applies the three recognized rewrites, each at most once per capture,
/// line by line so a chunk containing multiple lines is handled correctly.
fn classify(chunk: &str, state: &mut CaptureState) -> String {
    let mut out = String::with_capacity(chunk.len());
    // `split_inclusive` keeps line terminators attached so re-joining is lossless.
    for line in chunk.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(b) => (b, "\n"),
            None => (line, ""),
        };

        if !state.classified_cache_warning && body.contains(CACHE_WARNING_NEEDLE) {
            state.classified_cache_warning = true;
            out.push_str("Note: ");
            out.push_str(body);
            out.push_str(newline);
            continue;
        }

        if !state.classified_gallery_command && body.contains(GALLERY_COMMAND_NEEDLE) {
            state.classified_gallery_command = true;
            out.push_str(&rewrite_gallery_command_line(body));
            out.push_str(newline);
            continue;
        }

        if !state.classified_no_export
            && body.contains(NO_EXPORT_NEEDLE)
            && body.contains(FOUND_NEEDLE)
        {
            state.classified_no_export = true;
            out.push_str("Note: This command is unavailable in the current context.");
            out.push_str(newline);
            continue;
        }

        out.push_str(body);
        out.push_str(newline);
    }
    out
}

/// `'<cmd>' is not extension gallery command` becomes an actionable error;
/// `modinfo` specifically gets pointed at `lmv`.
fn rewrite_gallery_command_line(line: &str) -> String {
    let command_name = line
        .find('\'')
        .and_then(|start| line[start + 1..].find('\'').map(|end| &line[start + 1..start + 1 + end]));

    match command_name {
        Some("modinfo") => {
            "Error: 'modinfo' is not an extension gallery command. Try 'lmv' instead.".to_owned()
        }
        Some(name) => format!("Error: '{name}' is not an extension gallery command."),
        None => format!("Error: {line}"),
    }
}

/// Acquires the debugger's previous output callback, installs `sink` in its
/// place, and restores the previous callback when the guard drops - even on
/// an early return or panic unwind, per the spec's "scoped install" note.
pub struct ScopedCapture<'a, A: DebuggerAdapter + ?Sized> {
    adapter: &'a A,
    previous: Option<Box<dyn OutputSink>>,
}

impl<'a, A: DebuggerAdapter + ?Sized> ScopedCapture<'a, A> {
    pub fn install(adapter: &'a A, sink: Box<dyn OutputSink>) -> Self {
        let previous = adapter.set_output_sink(Some(sink));
        Self { adapter, previous }
    }
}

impl<'a, A: DebuggerAdapter + ?Sized> Drop for ScopedCapture<'a, A> {
    fn drop(&mut self) {
        self.adapter.set_output_sink(self.previous.take());
    }
}
