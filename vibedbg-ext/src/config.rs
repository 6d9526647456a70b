//! Extension configuration, read from the environment.
//!
//! Matches the spec's named defaults exactly; every value can be overridden
//! by a `VIBEDBG_*` environment variable for local testing and for the
//! `vibedbg-harness` binary, without requiring a config file.

use std::time::Duration;

use crate::engine::{EngineOptions, DEFAULT_TIMEOUT};
use crate::server::ServerConfig;

const ENV_PIPE_NAME: &str = "VIBEDBG_PIPE_NAME";
const ENV_MAX_INSTANCES: &str = "VIBEDBG_MAX_INSTANCES";
const ENV_BUFFER_SIZE: &str = "VIBEDBG_BUFFER_SIZE";
const ENV_COMMAND_TIMEOUT_MS: &str = "VIBEDBG_COMMAND_TIMEOUT_MS";
const ENV_VALIDATE_COMMANDS: &str = "VIBEDBG_VALIDATE_COMMANDS";
const ENV_RETRY_COUNT: &str = "VIBEDBG_RETRY_COUNT";
const ENV_HEARTBEAT_SECS: &str = "VIBEDBG_HEARTBEAT_SECS";
const ENV_LOG_FILTER: &str = "RUST_LOG";

#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    pub server: ServerConfig,
    pub engine_options: EngineOptions,
    pub log_filter: String,
}

impl ExtensionConfig {
    /// Reads every `VIBEDBG_*` variable, falling back to the spec's defaults
    /// for anything unset or unparsable. Never errors: a malformed override
    /// is logged and the default wins, rather than aborting extension load.
    pub fn from_env() -> Self {
        let mut server = ServerConfig::default();
        let mut engine_options = EngineOptions::default();

        if let Some(name) = read_string(ENV_PIPE_NAME) {
            server.pipe_name = name;
        }
        if let Some(n) = read_parsed::<u32>(ENV_MAX_INSTANCES) {
            server.max_instances = n;
        }
        if let Some(n) = read_parsed::<u32>(ENV_BUFFER_SIZE) {
            server.buffer_size = n;
        }
        if let Some(secs) = read_parsed::<u64>(ENV_HEARTBEAT_SECS) {
            server.heartbeat_interval = Some(Duration::from_secs(secs));
        }

        if let Some(ms) = read_parsed::<u64>(ENV_COMMAND_TIMEOUT_MS) {
            engine_options.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(validate) = read_parsed::<bool>(ENV_VALIDATE_COMMANDS) {
            engine_options.validate = validate;
        }
        if let Some(retries) = read_parsed::<u32>(ENV_RETRY_COUNT) {
            engine_options.retry_count = retries;
        }

        let log_filter = read_string(ENV_LOG_FILTER).unwrap_or_else(|| "info".to_owned());

        Self {
            server,
            engine_options,
            log_filter,
        }
    }
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine_options: EngineOptions {
                timeout: Some(DEFAULT_TIMEOUT),
                ..EngineOptions::default()
            },
            log_filter: "info".to_owned(),
        }
    }
}

fn read_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

fn read_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_server_config_defaults() {
        let config = ExtensionConfig::default();
        assert_eq!(config.server.pipe_name, ServerConfig::default().pipe_name);
        assert_eq!(config.server.max_instances, 10);
    }

    #[test]
    fn malformed_override_falls_back_to_default() {
        std::env::set_var(ENV_MAX_INSTANCES, "not-a-number");
        let config = ExtensionConfig::from_env();
        assert_eq!(config.server.max_instances, 10);
        std::env::remove_var(ENV_MAX_INSTANCES);
    }

    #[test]
    fn valid_override_is_applied() {
        std::env::set_var(ENV_PIPE_NAME, r"\\.\pipe\vibedbg_test_override");
        let config = ExtensionConfig::from_env();
        assert_eq!(config.server.pipe_name, r"\\.\pipe\vibedbg_test_override");
        std::env::remove_var(ENV_PIPE_NAME);
    }
}
