use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start Stata: {0}")]
    Startup(String),

    #[error("Stata session not ready")]
    NotReady,

    #[error("an execution is already running on this session")]
    Busy,

    #[error("Stata channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid macro name: {0:?}")]
    InvalidMacroName(String),

    #[error("macro value cannot contain the compound quote closer \"': {0:?}")]
    InvalidMacroValue(String),
}

impl SessionError {
    pub(crate) fn startup(context: &str, err: impl std::fmt::Display) -> Self {
        SessionError::Startup(format!("{context}: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a positive number of seconds (got {value:?})")]
    InvalidDuration { name: String, value: String },

    #[error("{name} must be a positive integer (got {value:?})")]
    InvalidInteger { name: String, value: String },

    #[error("unsupported graph format {0:?} (expected png, svg, pdf or eps)")]
    InvalidGraphFormat(String),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
