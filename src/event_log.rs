//! Opt-in JSONL trace of server and session activity.
//!
//! Every line is one record: a sequence number, wall-clock and uptime stamps, the server pid, and
//! an `event` name with its `payload`. Nothing is written unless a directory was configured at
//! startup (`--debug-events-dir` or `STATA_REPL_DEBUG_EVENTS_DIR`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::output::ExecutionResult;

pub const DEBUG_EVENTS_DIR_ENV: &str = "STATA_REPL_DEBUG_EVENTS_DIR";
const FILE_STEM: &str = "stata-repl-events";
const MAX_NAME_ATTEMPTS: u32 = 100;

static EVENT_LOG: OnceLock<Option<EventLog>> = OnceLock::new();

/// How the process was launched. Written as the `startup` record.
#[derive(Debug, Clone, Serialize)]
pub struct StartupContext {
    pub mode: String,
    pub stata_path: String,
    pub graph_dir: Option<String>,
}

/// Lifecycle of the Stata process behind a session.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent<'a> {
    SessionStart {
        pid: Option<u32>,
        executable: String,
    },
    SessionStartError {
        executable: String,
        error: String,
    },
    Execution {
        elapsed_ms: u64,
        boundary_found: bool,
        result: &'a ExecutionResult,
    },
    /// Stata went away on its own while a submission was running.
    SessionExit {
        pid: Option<u32>,
        status: String,
    },
    Interrupt {
        pid: Option<u32>,
    },
    ShutdownEscalation {
        pid: Option<u32>,
        signal: &'static str,
    },
    SessionShutdown {
        pid: Option<u32>,
    },
}

#[derive(Serialize)]
struct Named<'a> {
    event: &'a str,
    payload: JsonValue,
}

#[derive(Serialize)]
struct StartupPayload<'a> {
    #[serde(flatten)]
    context: &'a StartupContext,
    version: &'static str,
    cwd: Option<String>,
    argv: Vec<String>,
    log_file: String,
}

#[derive(Serialize)]
struct Record<'a, E> {
    seq: u64,
    ts_unix_ms: u64,
    uptime_ms: u64,
    server_pid: u32,
    #[serde(flatten)]
    entry: &'a E,
}

struct EventLog {
    file: Mutex<File>,
    path: PathBuf,
    opened: Instant,
    seq: AtomicU64,
}

impl EventLog {
    fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let (file, path) = open_fresh_file(dir, unix_ms_now(), std::process::id())?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            opened: Instant::now(),
            seq: AtomicU64::new(0),
        })
    }

    fn append<E: Serialize>(&self, entry: &E) -> io::Result<()> {
        let record = Record {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            ts_unix_ms: unix_ms_now(),
            uptime_ms: self.opened.elapsed().as_millis() as u64,
            server_pid: std::process::id(),
            entry,
        };
        let mut line = serde_json::to_vec(&record).map_err(io::Error::other)?;
        line.push(b'\n');
        // One write per record keeps lines whole when several threads log at once.
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
    }

    fn append_startup(&self, context: &StartupContext) -> io::Result<()> {
        let payload = StartupPayload {
            context,
            version: env!("CARGO_PKG_VERSION"),
            cwd: std::env::current_dir()
                .ok()
                .map(|path| path.to_string_lossy().into_owned()),
            argv: std::env::args_os()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            log_file: self.path.to_string_lossy().into_owned(),
        };
        let payload = serde_json::to_value(&payload).map_err(io::Error::other)?;
        self.append(&Named {
            event: "startup",
            payload,
        })
    }
}

/// Opens the event log when a directory is configured (flag first, then env) and writes the
/// `startup` record. Later calls are ignored.
pub fn initialize(debug_events_dir: Option<PathBuf>, context: StartupContext) -> io::Result<()> {
    if EVENT_LOG.get().is_some() {
        return Ok(());
    }
    let log = match resolve_debug_dir(debug_events_dir) {
        Some(dir) => {
            let log = EventLog::open(&dir)?;
            log.append_startup(&context)?;
            tracing::info!(path = %log.path.display(), "debug event log enabled");
            Some(log)
        }
        None => None,
    };
    let _ = EVENT_LOG.set(log);
    Ok(())
}

fn current() -> Option<&'static EventLog> {
    EVENT_LOG.get().and_then(Option::as_ref)
}

pub fn enabled() -> bool {
    current().is_some()
}

pub fn log(event: &str, payload: JsonValue) {
    if let Some(log) = current() {
        let _ = log.append(&Named { event, payload });
    }
}

/// Like `log`, but only builds the payload when the log is open.
pub fn log_lazy(event: &str, payload: impl FnOnce() -> JsonValue) {
    if let Some(log) = current() {
        let _ = log.append(&Named {
            event,
            payload: payload(),
        });
    }
}

pub fn record(event: &SessionEvent<'_>) {
    if let Some(log) = current() {
        let _ = log.append(event);
    }
}

fn resolve_debug_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| {
            std::env::var_os(DEBUG_EVENTS_DIR_ENV)
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from)
        })
}

/// Creates `<stem>-<pid>-<ms>.jsonl`, adding `-<n>` when another process got there first.
fn open_fresh_file(dir: &Path, unix_ms: u64, pid: u32) -> io::Result<(File, PathBuf)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{FILE_STEM}-{pid}-{unix_ms}.jsonl"),
            n => format!("{FILE_STEM}-{pid}-{unix_ms}-{n}.jsonl"),
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free event log name in {}", dir.display()),
    ))
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
