//! `vibedbg-harness`: a dev binary that runs the pipe server, command
//! engine, and router against a [`MockAdapter`] outside a live debugger.
//!
//! Mirrors the shape of the headless client's `ipc_service` binary: a
//! `clap::Subcommand` with `Run`/`RunDebug`/`RunSmokeTest`, where the debug
//! variant just adds louder logging and the smoke-test variant accepts
//! exactly one client then exits so automated checks have a deterministic
//! endpoint instead of a server that runs forever.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use vibedbg_ext::adapter::mock::MockAdapter;
use vibedbg_ext::{Controller, DebuggerAdapter, ExtensionConfig};

#[derive(Parser)]
#[command(author, version, about = "vibedbg development harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Pipe name to listen on; defaults to the same name the extension uses.
    #[arg(long, env = "VIBEDBG_PIPE_NAME")]
    pipe_name: Option<String>,
}

#[derive(clap::Subcommand, Default)]
enum Cmd {
    /// Run the server until killed.
    #[default]
    Run,
    /// Run the server with verbose logging.
    RunDebug,
    /// Accept exactly one client connection, then exit.
    RunSmokeTest,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ExtensionConfig::from_env();
    if let Some(pipe_name) = cli.pipe_name {
        config.server.pipe_name = pipe_name;
    }
    if matches!(cli.command, Cmd::RunDebug) {
        config.log_filter = "debug".to_owned();
    }
    let _reload_handle = vibedbg_ext::logging::init(&config.log_filter)?;

    let adapter: Arc<dyn DebuggerAdapter> = Arc::new(MockAdapter::new());

    match cli.command {
        Cmd::Run | Cmd::RunDebug => run(adapter, config),
        Cmd::RunSmokeTest => run_smoke_test(adapter, config),
    }
}

fn run(adapter: Arc<dyn DebuggerAdapter>, config: ExtensionConfig) -> anyhow::Result<()> {
    let controller = Controller::global();
    controller.initialize(adapter, config)?;
    tracing::info!("vibedbg harness listening, press Ctrl+C to stop");

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    controller.uninitialize();
    Ok(())
}

/// Starts the controller, waits until exactly one pipe client has connected
/// and disconnected (or a short timeout elapses), then tears down. Gives a
/// deterministic exit point for scripted checks instead of a server that
/// never returns on its own.
fn run_smoke_test(adapter: Arc<dyn DebuggerAdapter>, config: ExtensionConfig) -> anyhow::Result<()> {
    let controller = Controller::global();
    controller.initialize(adapter, config)?;
    tracing::info!("vibedbg harness smoke test: waiting for one client");

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    let mut seen_a_client = false;
    loop {
        let active = controller.status().map(|s| s.active_connections).unwrap_or(0);
        if active > 0 {
            seen_a_client = true;
        } else if seen_a_client {
            break;
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("smoke test timed out waiting for a client");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    controller.uninitialize();
    tracing::info!("vibedbg harness smoke test: client served, exiting");
    Ok(())
}

