use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use stata_repl::config::{GraphExport, GraphFormat, SessionConfig, parse_duration_secs};
use stata_repl::{cancel, debug_repl, event_log, server};

const LOG_LEVEL_ENV: &str = "STATA_REPL_LOG";

#[derive(Parser)]
#[command(name = "stata-repl")]
#[command(about = "Drive a persistent Stata session over MCP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    options: CliOptions,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the MCP server on stdio (default)
    Serve,
    /// Line-oriented REPL against Stata for debugging
    DebugRepl,
}

#[derive(Args)]
struct CliOptions {
    /// Stata executable (falls back to STATA_PATH, then the platform default)
    #[arg(long, global = true)]
    stata_path: Option<PathBuf>,

    /// Execution timeout in seconds
    #[arg(long, global = true, value_parser = parse_timeout_arg)]
    timeout_secs: Option<Duration>,

    /// Directory for exported graphs (default: a per-process temp directory)
    #[arg(long, global = true)]
    graph_dir: Option<PathBuf>,

    /// Graph export format: png, svg, pdf or eps
    #[arg(long, global = true, default_value = "png", value_parser = parse_graph_format)]
    graph_format: GraphFormat,

    /// Do not export graphs after each call
    #[arg(long, global = true)]
    no_graph_export: bool,

    /// Write JSONL debug events to this directory
    #[arg(long, global = true, env = event_log::DEBUG_EVENTS_DIR_ENV)]
    debug_events_dir: Option<PathBuf>,

    /// Log filter for stderr logging (e.g. info, debug, stata_repl=trace)
    #[arg(long, global = true, env = LOG_LEVEL_ENV, default_value = "info")]
    log_level: String,
}

fn parse_timeout_arg(value: &str) -> Result<Duration, String> {
    parse_duration_secs("--timeout-secs", value).map_err(|err| err.to_string())
}

fn parse_graph_format(value: &str) -> Result<GraphFormat, String> {
    GraphFormat::parse(value).map_err(|err| err.to_string())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // stdout is the MCP transport. If the client goes away mid-write, surface EPIPE as an error
    // instead of dying on SIGPIPE.
    ignore_sigpipe();

    let cli = Cli::parse();
    init_tracing(&cli.options.log_level);

    let command = cli.command.unwrap_or(Command::Serve);
    let config = session_config(&cli.options)?;
    event_log::initialize(
        cli.options.debug_events_dir.clone(),
        event_log::StartupContext {
            mode: match command {
                Command::Serve => "server".to_string(),
                Command::DebugRepl => "debug_repl".to_string(),
            },
            stata_path: config.resolved_executable().to_string_lossy().to_string(),
            graph_dir: config
                .graph_export
                .as_ref()
                .map(|export| export.dir.to_string_lossy().to_string()),
        },
    )?;

    match command {
        Command::Serve => {
            tokio::spawn(cancel::listen_for_shutdown_signals());
            server::run(config).await
        }
        Command::DebugRepl => {
            tokio::task::spawn_blocking(move || {
                debug_repl::run(config).map_err(|err| err.to_string())
            })
            .await??;
            Ok(())
        }
    }
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn session_config(options: &CliOptions) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = SessionConfig::from_env()?;
    if let Some(path) = &options.stata_path {
        config = config.with_executable(path.clone());
    }
    if let Some(timeout) = options.timeout_secs {
        config = config.with_execute_timeout(timeout);
    }
    if !options.no_graph_export {
        let dir = options.graph_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("stata-repl-graphs-{}", std::process::id()))
        });
        std::fs::create_dir_all(&dir)?;
        config = config.with_graph_export(Some(GraphExport {
            dir,
            format: options.graph_format,
        }));
    }
    Ok(config)
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
