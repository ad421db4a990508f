use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, ProtocolVersion, ServerCapabilities,
    ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

mod response;
mod timeouts;

use self::response::{
    OutputFormat, execution_to_contents, finalize_batch, session_error_contents,
};
use self::timeouts::{CONTROL_TIMEOUT, apply_tool_call_margin, resolve_timeout_ms};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::output::ExecutionResult;
use crate::session::StataSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlAction {
    Interrupt,
    Restart,
}

/// Leading `\u{3}` interrupts and `\u{4}` restarts; whatever follows is run afterwards.
fn split_control_prefix(input: &str) -> Option<(ControlAction, &str)> {
    let first = input.chars().next()?;
    let action = match first {
        '\u{3}' => ControlAction::Interrupt,
        '\u{4}' => ControlAction::Restart,
        _ => return None,
    };

    let tail = &input[first.len_utf8()..];
    let tail = if let Some(rest) = tail.strip_prefix("\r\n") {
        rest
    } else if let Some(rest) = tail.strip_prefix('\n') {
        rest
    } else if let Some(rest) = tail.strip_prefix('\r') {
        rest
    } else {
        tail
    };
    Some((action, tail))
}

#[derive(Clone)]
struct SharedSession {
    session: Arc<StataSession>,
    start_lock: Arc<Mutex<()>>,
}

impl SharedSession {
    fn new(config: SessionConfig) -> Self {
        Self {
            session: Arc::new(StataSession::new(config)),
            start_lock: Arc::new(Mutex::new(())),
        }
    }

    fn session(&self) -> Arc<StataSession> {
        Arc::clone(&self.session)
    }

    async fn run_session<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&StataSession, &Mutex<()>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self.session.clone();
        let start_lock = self.start_lock.clone();
        tokio::task::spawn_blocking(move || f(&session, &start_lock))
            .await
            .map_err(|err| McpError::internal_error(err.to_string(), None))
    }

    async fn run_input(
        &self,
        input: String,
        timeout: Duration,
        format: OutputFormat,
    ) -> Result<CallToolResult, McpError> {
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "stata",
                "input": input.clone(),
                "timeout_ms": timeout.as_millis(),
            })
        });

        let mut contents = Vec::new();
        let code = match split_control_prefix(&input) {
            Some((ControlAction::Interrupt, rest)) => {
                match self.session.interrupt() {
                    Ok(()) => contents.push(Content::text("[interrupt sent]")),
                    Err(err) => contents.extend(tool_error_contents("stata", &err)),
                }
                rest.to_string()
            }
            Some((ControlAction::Restart, rest)) => {
                let restarted = self
                    .run_session(|session, start_lock| {
                        let _guard = start_lock.lock().unwrap_or_else(PoisonError::into_inner);
                        session.restart()
                    })
                    .await?;
                match restarted {
                    Ok(()) => contents.push(Content::text("[stata session restarted]")),
                    Err(err) => contents.extend(tool_error_contents("stata", &err)),
                }
                rest.to_string()
            }
            None => input,
        };

        if !code.trim().is_empty() {
            let exec_timeout = apply_tool_call_margin(timeout);
            let result = self
                .run_session(move |session, start_lock| {
                    ensure_started(session, start_lock)?;
                    session.execute_with_timeout(&code, exec_timeout)
                })
                .await?;
            contents.extend(execution_result_to_contents(result, format));
        }

        let tool_result = finalize_batch(contents);
        log_tool_result("stata", &tool_result);
        Ok(tool_result)
    }
}

/// Starts the session if it is not running. Serialized so a warm start and a tool call never
/// race to launch two processes.
fn ensure_started(session: &StataSession, start_lock: &Mutex<()>) -> Result<(), SessionError> {
    let _guard = start_lock.lock().unwrap_or_else(PoisonError::into_inner);
    if session.is_ready() {
        return Ok(());
    }
    session.start()
}

fn execution_result_to_contents(
    result: Result<ExecutionResult, SessionError>,
    format: OutputFormat,
) -> Vec<Content> {
    match result {
        Ok(result) => execution_to_contents(&result, format),
        Err(err) => tool_error_contents("stata", &err),
    }
}

/// Session failures are reported as tool text, and traced.
fn tool_error_contents(tool: &str, err: &SessionError) -> Vec<Content> {
    tracing::warn!(tool, error = %err, "stata tool call failed");
    crate::event_log::log(
        "tool_call_error",
        json!({
            "tool": tool,
            "error": err.to_string(),
        }),
    );
    session_error_contents(err)
}

fn log_tool_result(tool: &str, result: &CallToolResult) {
    crate::event_log::log_lazy("tool_call_end", || {
        let serialized = serde_json::to_value(result)
            .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
        json!({
            "tool": tool,
            "result": serialized,
        })
    });
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        instructions: Some(format!(
            "stata-repl {}: a persistent Stata session. Run commands with the `stata` tool; \
             state (data in memory, macros, graphs) carries over between calls.",
            env!("CARGO_PKG_VERSION")
        )),
        ..ServerInfo::default()
    }
}

#[derive(Clone)]
struct StataToolServer {
    shared: SharedSession,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl StataToolServer {
    fn new(config: SessionConfig) -> Self {
        Self {
            shared: SharedSession::new(config),
            tool_router: Self::tool_router(),
        }
    }

    fn get_info(&self) -> ServerInfo {
        server_info()
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_tool.md")]
    #[tool(name = "stata")]
    async fn stata(&self, params: Parameters<StataArgs>) -> Result<CallToolResult, McpError> {
        let StataArgs {
            input,
            timeout_ms,
            format,
        } = params.0;
        let default_timeout = self.shared.session.config().execute_timeout;
        let timeout = resolve_timeout_ms(timeout_ms, default_timeout, "stata")?;
        self.shared
            .run_input(input, timeout, format.unwrap_or_default())
            .await
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_interrupt_tool.md")]
    #[tool(name = "stata_interrupt")]
    async fn stata_interrupt(
        &self,
        _params: Parameters<EmptyArgs>,
    ) -> Result<CallToolResult, McpError> {
        crate::event_log::log("tool_call_begin", json!({"tool": "stata_interrupt"}));
        let contents = match self.shared.session.interrupt() {
            Ok(()) => vec![Content::text("[interrupt sent]")],
            Err(err) => tool_error_contents("stata_interrupt", &err),
        };
        let tool_result = finalize_batch(contents);
        log_tool_result("stata_interrupt", &tool_result);
        Ok(tool_result)
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_reset_tool.md")]
    #[tool(name = "stata_reset")]
    async fn stata_reset(&self, _params: Parameters<EmptyArgs>) -> Result<CallToolResult, McpError> {
        crate::event_log::log("tool_call_begin", json!({"tool": "stata_reset"}));
        let restarted = tokio::time::timeout(
            CONTROL_TIMEOUT,
            self.shared.run_session(|session, start_lock| {
                let _guard = start_lock.lock().unwrap_or_else(PoisonError::into_inner);
                session.restart()
            }),
        )
        .await
        .map_err(|_| McpError::internal_error("timed out restarting stata", None))??;
        let contents = match restarted {
            Ok(()) => vec![Content::text("[stata session restarted]")],
            Err(err) => tool_error_contents("stata_reset", &err),
        };
        let tool_result = finalize_batch(contents);
        log_tool_result("stata_reset", &tool_result);
        Ok(tool_result)
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_version_tool.md")]
    #[tool(name = "stata_version")]
    async fn stata_version(
        &self,
        _params: Parameters<EmptyArgs>,
    ) -> Result<CallToolResult, McpError> {
        crate::event_log::log("tool_call_begin", json!({"tool": "stata_version"}));
        let version = self
            .shared
            .run_session(|session, start_lock| {
                ensure_started(session, start_lock)?;
                session.get_version()
            })
            .await?;
        let contents = match version {
            Ok(version) => vec![Content::text(version)],
            Err(err) => tool_error_contents("stata_version", &err),
        };
        let tool_result = finalize_batch(contents);
        log_tool_result("stata_version", &tool_result);
        Ok(tool_result)
    }
}

#[tool_handler]
impl ServerHandler for StataToolServer {
    fn get_info(&self) -> ServerInfo {
        StataToolServer::get_info(self)
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct StataArgs {
    /// Stata commands, one per line.
    input: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// `text` (default) or `html`.
    #[serde(default)]
    format: Option<OutputFormat>,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct EmptyArgs {}

pub async fn run(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        executable = %config.resolved_executable().display(),
        "starting stata-repl server"
    );
    crate::event_log::log(
        "server_run_begin",
        json!({
            "stata_path": config.resolved_executable().to_string_lossy(),
        }),
    );
    let service = StataToolServer::new(config);
    let shared = service.shared.clone();

    let warm = shared.clone();
    thread::spawn(move || {
        crate::event_log::log("session_warm_start_begin", json!({}));
        let session = warm.session();
        if let Err(err) = ensure_started(&session, &warm.start_lock) {
            tracing::warn!(error = %err, "stata warm start failed");
            crate::event_log::log(
                "session_warm_start_error",
                json!({
                    "error": err.to_string(),
                }),
            );
            return;
        }
        crate::event_log::log(
            "session_warm_start_end",
            json!({"status": "ok", "pid": session.pid()}),
        );
    });

    crate::event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        let service_cancel = running.cancellation_token();
        let shutdown = crate::cancel::process_token();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            service_cancel.cancel();
        });
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    let session = shared.session();
    let stopped = tokio::task::spawn_blocking(move || session.shutdown()).await;
    if let Ok(Err(err)) = &stopped {
        tracing::warn!(error = %err, "stata shutdown failed");
    }
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => crate::event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
