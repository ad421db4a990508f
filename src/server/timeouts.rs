use std::time::Duration;

use rmcp::model::ErrorData as McpError;

const TOOL_CALL_MARGIN_MIN: Duration = Duration::from_millis(200);
const TOOL_CALL_MARGIN_MAX: Duration = Duration::from_secs(2);
const TOOL_CALL_MARGIN_FRACTION: f64 = 0.05;
const TOOL_CALL_MARGIN_THRESHOLD: Duration = Duration::from_secs(2);

pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn resolve_timeout_ms(
    timeout_ms: Option<u64>,
    default: Duration,
    tool_name: &str,
) -> Result<Duration, McpError> {
    match timeout_ms {
        None => Ok(default),
        Some(0) => Err(McpError::invalid_params(
            format!("timeout_ms for {tool_name} must be a positive number of milliseconds"),
            None,
        )),
        Some(value) => Ok(Duration::from_millis(value)),
    }
}

pub(crate) fn apply_tool_call_margin(duration: Duration) -> Duration {
    // The MCP client usually enforces its own deadline. Returning a little before the requested
    // timeout keeps a partial Stata result from turning into a client-side RPC timeout.
    if duration < TOOL_CALL_MARGIN_THRESHOLD {
        return duration;
    }
    let margin = duration
        .mul_f64(TOOL_CALL_MARGIN_FRACTION)
        .clamp(TOOL_CALL_MARGIN_MIN, TOOL_CALL_MARGIN_MAX);
    duration.saturating_sub(margin)
}
