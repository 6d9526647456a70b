//! Logging setup: a reloadable [`EnvFilter`] over an stdout `fmt` layer.
//!
//! Grounded in the headless client's `setup_stdout_logging` (the extension
//! has no log file of its own — WinDbg's own console is the sink, reached
//! the same way a headless process's stdout is).

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("log filter couldn't be parsed: {0}")]
    Parse(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to apply reloaded filter: {0}")]
    Reload(#[from] reload::Error),
    #[error(transparent)]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

pub type FilterReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the global subscriber and returns a handle that lets the
/// extension's `status`/`execute` FFI entry points change verbosity at
/// runtime without reloading the extension DLL.
pub fn init(directives: &str) -> Result<FilterReloadHandle, LoggingError> {
    let filter = EnvFilter::from_str(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reloader) = reload::Layer::new(filter);
    let layer = fmt::layer().with_ansi(false).with_target(true).with_filter(filter);
    Registry::default().with(layer).try_init()?;
    Ok(reloader)
}

/// Applies a new filter string to an already-installed subscriber. Invalid
/// directives leave the previous filter in place.
pub fn reload(handle: &FilterReloadHandle, directives: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::from_str(directives)?;
    handle.reload(filter)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_directives_fall_back_to_info() {
        // `EnvFilter::from_str` rejects this; `init` must not panic on it.
        let filter = EnvFilter::from_str("!!!not a filter!!!");
        assert!(filter.is_err());
    }
}
