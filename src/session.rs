//! One Stata process and the start / execute / interrupt / shutdown lifecycle around it.
//!
//! `execute` holds the channel lock for the whole submission; a second caller gets
//! `SessionError::Busy` instead of waiting. `interrupt` only touches the signaller, so it can be
//! called from another thread while an execution is blocked reading.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::channel::{
    Capture, ChannelLauncher, ChunkEnd, ProcessSignaller, ReadOutcome, ReplChannel, ReplSignal,
    deadline_after, drain_until_idle, read_until_boundary,
};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::event_log::{self, SessionEvent};
use crate::marker::Marker;
use crate::output::{ExecutionResult, parse_execution_output};
use crate::pty::PtyLauncher;

const EXIT_COMMAND: &str = "exit, clear";
const VERSION_COMMAND: &str = "display c(version)";
const UNKNOWN_VERSION: &str = "Unknown";
const MAX_MACRO_NAME_LEN: usize = 31;
const COMPOUND_QUOTE_CLOSE: &str = "\"'";
const EXIT_POLL: Duration = Duration::from_millis(20);
const TERM_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    Executing,
    ShuttingDown,
    Terminated,
}

pub struct StataSession {
    config: SessionConfig,
    launcher: Arc<dyn ChannelLauncher>,
    state: Mutex<SessionState>,
    channel: Mutex<Option<Box<dyn ReplChannel>>>,
    signaller: Mutex<Option<Arc<dyn ProcessSignaller>>>,
    pid: Mutex<Option<u32>>,
    cancel: Mutex<CancellationToken>,
    graphs_exported: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StataSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_launcher(config, Arc::new(PtyLauncher))
    }

    pub fn with_launcher(config: SessionConfig, launcher: Arc<dyn ChannelLauncher>) -> Self {
        let cancel = config.cancel.child_token();
        Self {
            config,
            launcher,
            state: Mutex::new(SessionState::Uninitialized),
            channel: Mutex::new(None),
            signaller: Mutex::new(None),
            pid: Mutex::new(None),
            cancel: Mutex::new(cancel),
            graphs_exported: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn executable(&self) -> PathBuf {
        self.config.resolved_executable()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), SessionState::Ready | SessionState::Executing)
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Spawns Stata, swallows the banner and applies the session settings.
    ///
    /// A banner that is still trickling in when the drain times out is not an error. Calling
    /// `start` on a live session does nothing.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Uninitialized | SessionState::Terminated => {
                    *state = SessionState::Starting;
                }
                SessionState::Ready | SessionState::Executing => return Ok(()),
                SessionState::Starting | SessionState::ShuttingDown => {
                    return Err(SessionError::NotReady);
                }
            }
        }

        let cancel = self.config.cancel.child_token();
        *lock(&self.cancel) = cancel.clone();

        let executable = self.executable();
        tracing::info!(executable = %executable.display(), "starting stata");
        let mut channel = match self.launcher.launch(&executable, &self.config.args) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(executable = %executable.display(), error = %err, "stata failed to start");
                event_log::record(&SessionEvent::SessionStartError {
                    executable: executable.to_string_lossy().into_owned(),
                    error: err.to_string(),
                });
                self.set_state(SessionState::Terminated);
                return Err(err);
            }
        };

        if let Err(err) = self.initialize(channel.as_mut(), &cancel) {
            tracing::warn!(error = %err, "stata startup failed");
            event_log::record(&SessionEvent::SessionStartError {
                executable: executable.to_string_lossy().into_owned(),
                error: err.to_string(),
            });
            let _ = escalate_exit(channel.as_mut(), Duration::ZERO);
            self.set_state(SessionState::Terminated);
            return Err(err);
        }

        let pid = channel.pid();
        *lock(&self.signaller) = Some(channel.signaller());
        *lock(&self.pid) = pid;
        *lock(&self.channel) = Some(channel);
        self.graphs_exported.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Ready);
        tracing::info!(pid = ?pid, "stata ready");
        event_log::record(&SessionEvent::SessionStart {
            pid,
            executable: executable.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    fn initialize(&self, channel: &mut dyn ReplChannel, cancel: &CancellationToken) -> Result<()> {
        let banner = drain_until_idle(
            channel,
            self.config.startup_idle,
            self.config.startup_timeout,
            cancel,
        )?;
        tracing::debug!(bytes = banner.bytes.len(), end = ?banner.end, "startup banner drained");
        if banner.end == Some(ChunkEnd::Closed) {
            return Err(exited_during_startup(channel, &banner));
        }

        let settings = format!("set more off\nset linesize {}", self.config.line_size);
        let capture = submit(
            channel,
            &settings,
            &[],
            self.config.startup_timeout,
            self.config.poll_interval,
            cancel,
        )?;
        match capture.end {
            _ if capture.found => {}
            Some(ChunkEnd::Closed) => return Err(exited_during_startup(channel, &capture)),
            Some(ChunkEnd::Cancelled) => {
                return Err(SessionError::Startup("startup cancelled".to_string()));
            }
            _ => tracing::warn!("stata did not acknowledge session settings before the timeout"),
        }
        Ok(())
    }

    pub fn execute(&self, code: &str) -> Result<ExecutionResult> {
        self.execute_with_timeout(code, self.config.execute_timeout)
    }

    /// Runs `code` and returns everything Stata printed before the boundary token.
    ///
    /// Hitting `timeout` yields the partial output, not an error; the process keeps running.
    pub fn execute_with_timeout(&self, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        let mut guard = match self.channel.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(SessionError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let Some(channel) = guard.as_mut() else {
            return Err(SessionError::NotReady);
        };
        if !self.transition(SessionState::Ready, SessionState::Executing) {
            return Err(SessionError::NotReady);
        }

        let cancel = lock(&self.cancel).clone();
        let epilogue = self.graph_export_epilogue();
        let started = Instant::now();
        let submitted = submit(
            channel.as_mut(),
            code,
            &epilogue,
            timeout,
            self.config.poll_interval,
            &cancel,
        );
        let capture = match submitted {
            Ok(capture) => capture,
            Err(err) => {
                tracing::warn!(error = %err, "stata submission failed");
                self.transition(SessionState::Executing, SessionState::Ready);
                return Err(err);
            }
        };

        match capture.end {
            _ if capture.found => {}
            Some(ChunkEnd::Deadline) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "stata execution timed out");
            }
            Some(ChunkEnd::Cancelled) => tracing::info!("stata execution cancelled"),
            Some(ChunkEnd::Closed) | None => {
                if let Ok(Some(status)) = channel.try_wait() {
                    tracing::warn!(%status, "stata exited during execution");
                    event_log::record(&SessionEvent::SessionExit {
                        pid: channel.pid(),
                        status: status.to_string(),
                    });
                    *guard = None;
                    *lock(&self.signaller) = None;
                    *lock(&self.pid) = None;
                    self.set_state(SessionState::Terminated);
                }
            }
        }

        let result = parse_execution_output(&capture.text());
        self.transition(SessionState::Executing, SessionState::Ready);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            bytes = capture.bytes.len(),
            boundary_found = capture.found,
            elapsed_ms,
            error_code = result.error_code,
            "stata execution finished"
        );
        event_log::record(&SessionEvent::Execution {
            elapsed_ms,
            boundary_found: capture.found,
            result: &result,
        });
        Ok(result)
    }

    /// Sends SIGINT to Stata's process group. The running `execute` sees `--Break--` and returns.
    pub fn interrupt(&self) -> Result<()> {
        let signaller = lock(&self.signaller).clone();
        let Some(signaller) = signaller else {
            return Err(SessionError::NotReady);
        };
        let pid = self.pid();
        tracing::info!(pid = ?pid, "interrupting stata");
        event_log::record(&SessionEvent::Interrupt { pid });
        signaller.signal(ReplSignal::Interrupt)
    }

    /// Value of a local macro, or an empty string when Stata reports an error.
    pub fn get_macro(&self, name: &str) -> Result<String> {
        validate_macro_name(name)?;
        let result = self.execute(&format!("display `\"`{name}'\"'"))?;
        if result.is_error {
            return Ok(String::new());
        }
        Ok(result.output)
    }

    /// Sets a local macro. Line breaks in `value` are replaced by spaces.
    ///
    /// The value is sent inside compound quotes, so it may hold `"` and `'` but not the closer
    /// `"'`; such values are rejected before anything reaches Stata.
    pub fn set_macro(&self, name: &str, value: &str) -> Result<ExecutionResult> {
        validate_macro_name(name)?;
        if value.contains(COMPOUND_QUOTE_CLOSE) {
            return Err(SessionError::InvalidMacroValue(value.to_string()));
        }
        let value = value.replace(['\r', '\n'], " ");
        self.execute(&format!("local {name} `\"{value}\"'"))
    }

    pub fn get_version(&self) -> Result<String> {
        let result = self.execute(VERSION_COMMAND)?;
        let version = result.output.trim();
        if result.is_error || version.is_empty() {
            return Ok(UNKNOWN_VERSION.to_string());
        }
        Ok(version.to_string())
    }

    pub fn restart(&self) -> Result<()> {
        self.shutdown()?;
        self.start()
    }

    /// Asks Stata to exit, then escalates to SIGTERM and SIGKILL. Safe to call repeatedly and on
    /// a session that never started.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Terminated | SessionState::ShuttingDown => return Ok(()),
                SessionState::Uninitialized => {
                    *state = SessionState::Terminated;
                    return Ok(());
                }
                _ => *state = SessionState::ShuttingDown,
            }
        }

        lock(&self.cancel).cancel();
        *lock(&self.signaller) = None;
        let channel = lock(&self.channel).take();
        let outcome = match channel {
            Some(mut channel) => {
                tracing::info!(pid = ?channel.pid(), "shutting down stata");
                event_log::record(&SessionEvent::SessionShutdown { pid: channel.pid() });
                let _ = channel.write_all(format!("{EXIT_COMMAND}\n").as_bytes());
                escalate_exit(channel.as_mut(), self.config.shutdown_grace)
            }
            None => Ok(()),
        };
        *lock(&self.pid) = None;
        self.set_state(SessionState::Terminated);
        outcome
    }

    fn graph_export_epilogue(&self) -> Vec<String> {
        let Some(export) = &self.config.graph_export else {
            return Vec::new();
        };
        let index = self.graphs_exported.fetch_add(1, Ordering::Relaxed) + 1;
        let path = export
            .dir
            .join(format!("stata_graph_{index}.{}", export.format.extension()));
        vec![
            "quietly capture graph describe Graph".to_string(),
            "if (_rc == 0) {".to_string(),
            format!("graph export \"{}\", replace", path.display()),
            "}".to_string(),
            "quietly graph drop _all".to_string(),
        ]
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

impl Drop for StataSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "stata shutdown on drop failed");
        }
    }
}

/// Discards stale output, writes the wrapped code and reads up to its boundary.
fn submit(
    channel: &mut dyn ReplChannel,
    code: &str,
    epilogue: &[String],
    timeout: Duration,
    tick: Duration,
    cancel: &CancellationToken,
) -> Result<Capture> {
    discard_pending(channel)?;
    let marker = Marker::new();
    let wrapped = marker.wrap(code, epilogue);
    channel.write_all(wrapped.as_bytes())?;
    read_until_boundary(channel, marker.token().as_bytes(), timeout, tick, cancel)
}

fn discard_pending(channel: &mut dyn ReplChannel) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut discarded = 0usize;
    while let ReadOutcome::Data(n) = channel.poll_read(&mut buf, Duration::ZERO)? {
        discarded += n;
    }
    if discarded > 0 {
        tracing::debug!(bytes = discarded, "discarded stale stata output");
    }
    Ok(())
}

fn exited_during_startup(channel: &mut dyn ReplChannel, capture: &Capture) -> SessionError {
    let status = match channel.try_wait() {
        Ok(Some(status)) => status.to_string(),
        _ => "closed terminal".to_string(),
    };
    let text = capture.text();
    let tail = text.trim();
    if tail.is_empty() {
        SessionError::Startup(format!("stata exited during startup ({status})"))
    } else {
        SessionError::Startup(format!("stata exited during startup ({status}): {tail}"))
    }
}

fn escalate_exit(channel: &mut dyn ReplChannel, grace: Duration) -> Result<()> {
    if wait_for_exit(channel, grace)? {
        return Ok(());
    }
    let signaller = channel.signaller();
    let pid = channel.pid();
    tracing::info!(pid = ?pid, "stata still running; sending SIGTERM");
    event_log::record(&SessionEvent::ShutdownEscalation {
        pid,
        signal: "SIGTERM",
    });
    signaller.signal(ReplSignal::Terminate)?;
    if wait_for_exit(channel, TERM_WAIT)? {
        return Ok(());
    }
    tracing::warn!(pid = ?pid, "stata ignored SIGTERM; sending SIGKILL");
    event_log::record(&SessionEvent::ShutdownEscalation {
        pid,
        signal: "SIGKILL",
    });
    signaller.signal(ReplSignal::Kill)?;
    channel.wait()?;
    Ok(())
}

fn wait_for_exit(channel: &mut dyn ReplChannel, within: Duration) -> Result<bool> {
    let deadline = deadline_after(within);
    loop {
        if let Some(status) = channel.try_wait()? {
            tracing::debug!(%status, "stata exited");
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(EXIT_POLL);
    }
}

fn validate_macro_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
                && name.len() <= MAX_MACRO_NAME_LEN
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidMacroName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::channel::fake::{Reply, ScriptedLauncher};
    use crate::config::{GraphExport, GraphFormat};
    use crate::output::{INTERRUPTED_MESSAGE, USER_BREAK_CODE};

    fn respond(line: &str) -> Reply {
        match line {
            "display 1+1" => Reply::Output("2\n".to_string()),
            "display c(version)" => Reply::Output("18\n".to_string()),
            "display `\"`greeting'\"'" => Reply::Output("hello world\n".to_string()),
            "display `\"`missing'\"'" => Reply::Output("\n".to_string()),
            "sleep 30000" => Reply::Stall,
            line if line.starts_with("bogus") => {
                Reply::Output("command bogus is unrecognized\nr(199);\n".to_string())
            }
            _ => Reply::Output(String::new()),
        }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_executable("/opt/fake/stata")
            .with_cancel(CancellationToken::new())
            .with_startup_timeout(Duration::from_secs(2))
            .with_execute_timeout(Duration::from_secs(2));
        config.startup_idle = Duration::from_millis(20);
        config.poll_interval = Duration::from_millis(5);
        config.shutdown_grace = Duration::from_millis(50);
        config
    }

    fn started(config: SessionConfig) -> (StataSession, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(ScriptedLauncher::new(respond));
        let session = StataSession::with_launcher(config, launcher.clone());
        session.start().expect("start");
        (session, launcher)
    }

    #[test]
    fn start_applies_settings_and_reports_ready() {
        let (session, launcher) = started(config());
        assert!(session.is_ready());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.pid(), Some(5151));
        let lines = launcher.last().state.lock().unwrap().lines.clone();
        assert_eq!(lines[0], "set more off");
        assert_eq!(lines[1], "set linesize 200");
    }

    #[test]
    fn execute_returns_clean_output() {
        let (session, _launcher) = started(config());
        let result = session.execute("display 1+1").expect("execute");
        assert_eq!(result.output, "2");
        assert!(!result.is_error);
    }

    #[test]
    fn stata_errors_are_results_not_failures() {
        let (session, _launcher) = started(config());
        let result = session.execute("bogus").expect("execute");
        assert!(result.is_error);
        assert_eq!(result.error_code, 199);
        assert_eq!(result.error_message, "command bogus is unrecognized");
        assert!(session.is_ready());
    }

    #[test]
    fn operations_fail_fast_before_start() {
        let launcher = Arc::new(ScriptedLauncher::new(respond));
        let session = StataSession::with_launcher(config(), launcher);
        assert!(matches!(session.execute("display 1"), Err(SessionError::NotReady)));
        assert!(matches!(session.interrupt(), Err(SessionError::NotReady)));
        session.shutdown().expect("shutdown");
        session.shutdown().expect("second shutdown");
    }

    #[test]
    fn interrupt_breaks_a_stalled_execution() {
        let (session, _launcher) = started(config().with_execute_timeout(Duration::from_secs(10)));
        let session = Arc::new(session);
        let runner = {
            let session = session.clone();
            thread::spawn(move || session.execute("sleep 30000"))
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Executing);
        assert!(matches!(session.execute("display 1+1"), Err(SessionError::Busy)));
        session.interrupt().expect("interrupt");

        let result = runner.join().expect("join").expect("execute");
        assert!(result.is_error);
        assert_eq!(result.error_code, USER_BREAK_CODE);
        assert_ne!(result.error_message, INTERRUPTED_MESSAGE);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.execute("display 1+1").expect("after").output, "2");
    }

    #[test]
    fn timeout_returns_partial_output() {
        let (session, _launcher) = started(config());
        let started = Instant::now();
        let result = session
            .execute_with_timeout("sleep 30000", Duration::from_millis(100))
            .expect("execute");
        assert!(!result.is_error);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(session.is_ready());
    }

    #[test]
    fn macros_round_trip_through_commands() {
        let (session, launcher) = started(config());
        session.set_macro("greeting", "hello world").expect("set");
        assert_eq!(session.get_macro("greeting").expect("get"), "hello world");
        assert_eq!(session.get_macro("missing").expect("get"), "");
        let lines = launcher.last().state.lock().unwrap().lines.clone();
        assert!(lines.contains(&"local greeting `\"hello world\"'".to_string()));
    }

    #[test]
    fn invalid_macro_names_are_rejected() {
        let (session, _launcher) = started(config());
        let too_long = "x".repeat(32);
        for name in ["", "1abc", "has space", "semi;colon", too_long.as_str()] {
            assert!(
                matches!(session.get_macro(name), Err(SessionError::InvalidMacroName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn macro_values_cannot_close_the_compound_quote() {
        let (session, launcher) = started(config());
        let err = session
            .set_macro("label", "say \"hi\"' now")
            .expect_err("closer in value");
        assert!(matches!(err, SessionError::InvalidMacroValue(_)));
        let lines = launcher.last().state.lock().unwrap().lines.clone();
        assert!(!lines.iter().any(|line| line.starts_with("local label")));

        session
            .set_macro("label", "it's \"quoted\"")
            .expect("plain quotes are fine");
        let lines = launcher.last().state.lock().unwrap().lines.clone();
        assert!(lines.contains(&"local label `\"it's \"quoted\"\"'".to_string()));
    }

    #[test]
    fn version_is_trimmed_output() {
        let (session, _launcher) = started(config());
        assert_eq!(session.get_version().expect("version"), "18");
    }

    #[test]
    fn shutdown_is_idempotent_and_exits_politely() {
        let (session, launcher) = started(config());
        session.shutdown().expect("shutdown");
        session.shutdown().expect("again");
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.is_ready());
        let repl = launcher.last();
        let state = repl.state.lock().unwrap();
        assert_eq!(state.lines.last().map(String::as_str), Some("exit, clear"));
        assert!(state.signals.is_empty());
        drop(state);
        assert!(matches!(session.execute("display 1"), Err(SessionError::NotReady)));
    }

    #[test]
    fn restart_launches_a_fresh_process() {
        let (session, launcher) = started(config());
        session.restart().expect("restart");
        assert!(session.is_ready());
        assert_eq!(launcher.launched.lock().unwrap().len(), 2);
    }

    #[test]
    fn graph_export_epilogue_follows_user_code() {
        let export = GraphExport {
            dir: Path::new("/tmp/graphs").to_path_buf(),
            format: GraphFormat::Svg,
        };
        let (session, launcher) = started(config().with_graph_export(Some(export)));
        session.execute("display 1+1").expect("first");
        session.execute("display 1+1").expect("second");
        let lines = launcher.last().state.lock().unwrap().lines.clone();
        assert!(lines.contains(&"graph export \"/tmp/graphs/stata_graph_1.svg\", replace".to_string()));
        assert!(lines.contains(&"graph export \"/tmp/graphs/stata_graph_2.svg\", replace".to_string()));
        let user = lines.iter().position(|line| line == "display 1+1").expect("user line");
        assert_eq!(lines[user + 1], "quietly capture graph describe Graph");
    }

    #[test]
    fn child_exit_during_execution_terminates_the_session() {
        let (session, _launcher) = started(config());
        let result = session.execute("exit, clear").expect("execute");
        assert!(!result.is_error);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.is_ready());
        assert_eq!(session.pid(), None);
        assert!(matches!(session.execute("display 1+1"), Err(SessionError::NotReady)));
        assert!(matches!(session.interrupt(), Err(SessionError::NotReady)));
    }

    #[test]
    fn shutdown_cancels_an_in_flight_execution() {
        let (session, launcher) = started(config().with_execute_timeout(Duration::from_secs(30)));
        let session = Arc::new(session);
        let started = Instant::now();
        let runner = {
            let session = session.clone();
            thread::spawn(move || session.execute("sleep 30000"))
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Executing);

        session.shutdown().expect("shutdown");
        let result = runner.join().expect("join").expect("execute");
        assert!(!result.is_error);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Terminated);
        // The stalled console never saw `exit, clear`, so shutdown had to signal it.
        let signals = launcher.last().state.lock().unwrap().signals.clone();
        assert_eq!(signals.first(), Some(&ReplSignal::Terminate));
    }

    #[test]
    fn process_cancellation_reaches_the_read_loop() {
        let parent = CancellationToken::new();
        let (session, _launcher) = started(
            config()
                .with_cancel(parent.clone())
                .with_execute_timeout(Duration::from_secs(30)),
        );
        let session = Arc::new(session);
        let started = Instant::now();
        let runner = {
            let session = session.clone();
            thread::spawn(move || session.execute("sleep 30000"))
        };
        thread::sleep(Duration::from_millis(100));
        parent.cancel();

        let result = runner.join().expect("join").expect("execute");
        assert!(!result.is_error);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn macro_name_rules() {
        assert!(validate_macro_name("_tmp1").is_ok());
        assert!(validate_macro_name(&"a".repeat(31)).is_ok());
        assert!(validate_macro_name("a-b").is_err());
    }
}
