//! Drive a console Stata process behind a pseudo-terminal.
//!
//! [`session::StataSession`] owns the process and runs submissions through a boundary-token
//! protocol; [`output`] turns the captured terminal text into an [`output::ExecutionResult`].
//! The `server` module exposes a session as MCP tools.

pub mod cancel;
pub mod channel;
pub mod config;
pub mod debug_repl;
pub mod error;
pub mod event_log;
pub mod graphics;
pub mod marker;
pub mod output;
pub mod pty;
pub mod server;
pub mod session;

pub use crate::config::SessionConfig;
pub use crate::error::{ConfigError, SessionError};
pub use crate::output::ExecutionResult;
pub use crate::session::{SessionState, StataSession};
