//! In-process WinDbg extension exposing the debugger's command surface to an
//! out-of-process AI assistant over a local named-pipe IPC channel.
//!
//! This crate is built both as the `cdylib` the debugger loads (`ffi`'s
//! `DebugExtensionInitialize`/`DebugExtensionUninitialize` are the DLL's
//! entry points) and as an `rlib` consumed by the `vibedbg-harness` dev
//! binary, the way the teacher's `headless-client` is built both standalone
//! and embedded in its GUI package.

pub mod adapter;
pub mod capture;
pub mod config;
pub mod controller;
pub mod engine;
pub mod ffi;
pub mod handle;
pub mod logging;
pub mod pipe_io;
pub mod router;
pub mod server;
pub mod session;

pub use adapter::{AdapterError, DebuggerAdapter, ExecResult, SymbolInfo};
pub use config::ExtensionConfig;
pub use controller::{Controller, ControllerError, ControllerStatus};
pub use engine::{BatchResult, CommandEngine, CommandResult, EngineOptions, EngineStatsSnapshot};
pub use server::{PipeServer, ServerConfig, ServerStatsSnapshot};
pub use session::SessionStore;
