use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

pub const STATA_PATH_ENV: &str = "STATA_PATH";
pub const TIMEOUT_ENV: &str = "STATA_REPL_TIMEOUT_SECS";
pub const STARTUP_TIMEOUT_ENV: &str = "STATA_REPL_STARTUP_TIMEOUT_SECS";
pub const LINE_SIZE_ENV: &str = "STATA_REPL_LINE_SIZE";

#[cfg(target_os = "windows")]
pub const DEFAULT_STATA_PATH: &str = "C:\\Program Files\\Stata18\\StataMP-64.exe";
#[cfg(target_os = "macos")]
pub const DEFAULT_STATA_PATH: &str = "/Applications/Stata/stata";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DEFAULT_STATA_PATH: &str = "/usr/local/stata/stata";

const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STARTUP_IDLE: Duration = Duration::from_millis(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_LINE_SIZE: u16 = 200;

/// Picks the Stata executable: explicit argument, then `STATA_PATH`, then the platform default.
/// The system `PATH` is never searched.
pub fn resolve_executable(explicit: Option<&Path>) -> PathBuf {
    resolve_executable_with(explicit, std::env::var_os(STATA_PATH_ENV))
}

fn resolve_executable_with(explicit: Option<&Path>, env_value: Option<OsString>) -> PathBuf {
    if let Some(path) = explicit
        && !path.as_os_str().is_empty()
    {
        return path.to_path_buf();
    }
    if let Some(value) = env_value
        && !value.is_empty()
    {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_STATA_PATH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Png,
    Svg,
    Pdf,
    Eps,
}

impl GraphFormat {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(GraphFormat::Png),
            "svg" => Ok(GraphFormat::Svg),
            "pdf" => Ok(GraphFormat::Pdf),
            "eps" => Ok(GraphFormat::Eps),
            other => Err(ConfigError::InvalidGraphFormat(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            GraphFormat::Png => "png",
            GraphFormat::Svg => "svg",
            GraphFormat::Pdf => "pdf",
            GraphFormat::Eps => "eps",
        }
    }
}

/// Where the export wrapper writes graphs left in memory by a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphExport {
    pub dir: PathBuf,
    pub format: GraphFormat,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub execute_timeout: Duration,
    pub startup_timeout: Duration,
    pub startup_idle: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub line_size: u16,
    pub graph_export: Option<GraphExport>,
    pub cancel: CancellationToken,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: vec!["-q".to_string()],
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            startup_idle: DEFAULT_STARTUP_IDLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            line_size: DEFAULT_LINE_SIZE,
            graph_export: None,
            cancel: crate::cancel::process_token(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by the `STATA_REPL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(TIMEOUT_ENV) {
            self.execute_timeout = parse_duration_secs(TIMEOUT_ENV, &value)?;
        }
        if let Some(value) = lookup(STARTUP_TIMEOUT_ENV) {
            self.startup_timeout = parse_duration_secs(STARTUP_TIMEOUT_ENV, &value)?;
        }
        if let Some(value) = lookup(LINE_SIZE_ENV) {
            self.line_size = value
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| ConfigError::InvalidInteger {
                    name: LINE_SIZE_ENV.to_string(),
                    value: value.clone(),
                })?;
        }
        Ok(())
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_graph_export(mut self, export: Option<GraphExport>) -> Self {
        self.graph_export = export;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn resolved_executable(&self) -> PathBuf {
        resolve_executable(self.executable.as_deref())
    }
}

pub fn parse_duration_secs(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        name: name.to_string(),
        value: value.to_string(),
    };
    let secs = value.trim().parse::<f64>().map_err(|_| invalid())?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}
