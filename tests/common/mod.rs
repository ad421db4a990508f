#![allow(dead_code)]

use std::error::Error;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent};
use rmcp::service::ServiceError;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use stata_repl::SessionConfig;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A POSIX shell that talks like a Stata console: banner, commands echoed after a `. ` prompt,
/// `r(###);` error signatures and `--Break--` on SIGINT. `sleep` takes milliseconds as in Stata.
const FAKE_STATA: &str = r#"#!/bin/sh
stty -echo 2>/dev/null
trap 'printf "\n--Break--\nr(1);\n"' INT
printf '  ___  ____  ____  ____  ____ (R)\n /__    /   ____/   /   ____/   fake Stata\n___/   /   /___/   /   /___/   for tests\n\n'
while IFS= read -r line; do
  printf '. %s\n' "$line"
  case "$line" in
    exit*) exit 0 ;;
    'display c(version)') printf '18.5\n' ;;
    display\ *) printf '%s\n' "${line#display }" | sed -e 's/" "//g' -e 's/"//g' ;;
    sleep\ *) sleep $(( ${line#sleep } / 1000 )) ;;
    set\ *|local\ *|quietly\ *|if\ *|'}'|graph\ *|'') ;;
    *) printf 'command %s is unrecognized\nr(199);\n' "${line%% *}" ;;
  esac
done
"#;

/// Writes the fake console into `dir` and returns its path.
pub fn write_fake_stata(dir: &Path) -> TestResult<PathBuf> {
    let path = dir.join("stata-mp");
    std::fs::write(&path, FAKE_STATA)?;
    let mut permissions = std::fs::metadata(&path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions)?;
    Ok(path)
}

/// Session settings tuned for the fake console: short idle windows, no graph export and a
/// private cancellation token so one test cannot cancel another.
pub fn fake_session_config(stata: &Path) -> SessionConfig {
    let mut config = SessionConfig::default()
        .with_executable(stata)
        .with_cancel(CancellationToken::new())
        .with_startup_timeout(Duration::from_secs(10))
        .with_execute_timeout(Duration::from_secs(10))
        .with_graph_export(None);
    config.startup_idle = Duration::from_millis(200);
    config.poll_interval = Duration::from_millis(20);
    config.shutdown_grace = Duration::from_millis(500);
    config
}

#[derive(Clone, Default)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct McpTestSession {
    service: rmcp::service::RunningService<rmcp::service::RoleClient, TestClient>,
    server_pid: Option<u32>,
    _stata_dir: tempfile::TempDir,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    pub async fn tool_names(&self) -> TestResult<Vec<String>> {
        let tools = self.service.list_all_tools().await?;
        Ok(tools.into_iter().map(|tool| tool.name.to_string()).collect())
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self.service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: tool.to_string().into(),
                arguments,
                task: None,
            })
            .await
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Starts the server binary against a fresh fake console.
pub async fn spawn_server() -> TestResult<McpTestSession> {
    spawn_server_with_args_and_env(Vec::new(), Vec::new()).await
}

/// Like `spawn_server`; an explicit `--stata-path` in `args` replaces the fake console.
pub async fn spawn_server_with_args_and_env(
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let stata_dir = tempfile::tempdir()?;
    let stata = write_fake_stata(stata_dir.path())?;
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.env_remove("STATA_PATH");
        cmd.env_remove("STATA_REPL_DEBUG_EVENTS_DIR");
        cmd.env("STATA_REPL_LOG", "warn");
        if !args.iter().any(|arg| arg == "--stata-path") {
            cmd.arg("--stata-path").arg(&stata);
        }
        cmd.arg("--no-graph-export");
        cmd.args(&args);
        for (key, value) in &env_vars {
            cmd.env(key, value);
        }
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
        _stata_dir: stata_dir,
    })
}

fn resolve_server_path() -> TestResult<PathBuf> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_stata-repl") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("stata-repl");

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate stata-repl test binary".into())
    }
}

fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
