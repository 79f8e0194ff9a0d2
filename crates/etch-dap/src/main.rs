//! etch-dap: debug adapter for Etch, speaking DAP over stdio.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use etch_bridge::{ExecSpawner, SessionConfig, WorkspaceRoots};

/// Debug adapter bridging DAP clients to `etch --debug-server`.
///
/// The adapter reads DAP requests on stdin and writes responses and events
/// on stdout. Logs never go to stdout.
#[derive(Debug, Parser)]
#[command(name = "etch-dap", version, about)]
struct Cli {
    /// Workspace root holding the `etch` executable. May be repeated; the
    /// deepest root containing the program wins. Defaults to the current directory.
    #[arg(long = "workspace-root", value_name = "DIR", env = "ETCH_DAP_WORKSPACE_ROOTS", value_delimiter = ',')]
    workspace_roots: Vec<PathBuf>,

    /// Debuggee executable name, relative to the workspace root.
    #[arg(long, env = "ETCH_DAP_EXECUTABLE", default_value = "etch")]
    executable: String,

    /// Flag that starts the debuggee in debug-server mode.
    #[arg(long, env = "ETCH_DAP_DEBUG_SERVER_FLAG", default_value = "--debug-server", allow_hyphen_values = true)]
    debug_server_flag: String,

    /// Time to wait for the debuggee before the handshake, in milliseconds.
    #[arg(long, env = "ETCH_DAP_SETTLE_DELAY_MS", default_value_t = 500)]
    settle_delay_ms: u64,

    /// Time to wait between `initialize` and `launch`, in milliseconds.
    #[arg(long, env = "ETCH_DAP_LAUNCH_DELAY_MS", default_value_t = 100)]
    launch_delay_ms: u64,

    /// How long a `stackTrace` waits for the debuggee, in milliseconds.
    #[arg(long, env = "ETCH_DAP_STACK_TRACE_TIMEOUT_MS", default_value_t = 1000)]
    stack_trace_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[arg(long, env = "ETCH_DAP_TERMINATE_GRACE_MS", default_value_t = 2000)]
    terminate_grace_ms: u64,

    /// How long to wait for the debuggee to exit when the front end closes, in milliseconds.
    #[arg(long, env = "ETCH_DAP_SHUTDOWN_GRACE_MS", default_value_t = 3000)]
    shutdown_grace_ms: u64,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "ETCH_DAP_LOG_FILE", value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_executable_name(self.executable.clone())
            .with_debug_server_flag(self.debug_server_flag.clone())
            .with_settle_delay(Duration::from_millis(self.settle_delay_ms))
            .with_launch_delay(Duration::from_millis(self.launch_delay_ms))
            .with_stack_trace_timeout(Duration::from_millis(self.stack_trace_timeout_ms))
            .with_terminate_grace(Duration::from_millis(self.terminate_grace_ms))
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
    }

    fn workspace_roots(&self) -> anyhow::Result<WorkspaceRoots> {
        if !self.workspace_roots.is_empty() {
            return Ok(WorkspaceRoots::new(self.workspace_roots.iter().cloned()));
        }
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        Ok(WorkspaceRoots::new([cwd]))
    }
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match std::env::var("ETCH_DAP_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("etch_dap={level},etch_bridge={level}"))
}

/// Initialize tracing with ETCH_DAP_LOG and LOG_FORMAT support.
///
/// The returned guard flushes the non-blocking writer on drop.
fn init_tracing(log_file: Option<&PathBuf>) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let registry = tracing_subscriber::registry().with(env_filter());
    if use_json {
        registry.with(fmt::layer().json().with_writer(writer)).try_init()?;
    } else {
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()?;
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_ref())?;

    let roots = cli.workspace_roots()?;
    info!(roots = ?roots.roots(), version = env!("CARGO_PKG_VERSION"), "etch-dap starting");

    etch_bridge::serve(
        cli.session_config(),
        Arc::new(roots),
        Arc::new(ExecSpawner),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
    .context("debug session failed")?;

    info!("etch-dap exiting");
    Ok(())
}
