use crate::config::HealthSettings;
use crate::docker::{
    command_line, service_states, ComposeTarget, DockerRunner, RunOutcome, ServiceState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Stopped,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailedLevel {
    L1Container,
    L2Protocol,
    L3Tools,
    L4Latency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub server_name: String,
    pub container_running: bool,
    pub protocol_responds: bool,
    pub tools_available: bool,
    pub response_time_ms: u64,
    #[serde(default)]
    pub tool_count: usize,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_level: Option<FailedLevel>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            container_running: false,
            protocol_responds: false,
            tools_available: false,
            response_time_ms: 0,
            tool_count: 0,
            status: HealthStatus::Unknown,
            failed_level: None,
            error_message: String::new(),
            checked_at: Utc::now(),
        }
    }

    fn fail(mut self, status: HealthStatus, level: FailedLevel, message: String) -> Self {
        self.status = status;
        self.failed_level = Some(level);
        self.error_message = message;
        self
    }
}

/// What to probe: the registry's view of one wrapped server.
#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub name: String,
    pub source_path: PathBuf,
    pub compose: ComposeTarget,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub result: HealthCheckResult,
    pub tool_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered: Option<bool>,
}

impl HealthReport {
    pub fn source_missing(&self) -> bool {
        self.result.status == HealthStatus::Unknown && self.result.failed_level.is_none()
    }
}

/// Maps the initialize round-trip time to a status.
pub fn classify_latency(settings: &HealthSettings, response_ms: u64) -> HealthStatus {
    if response_ms < settings.healthy_below_ms {
        HealthStatus::Healthy
    } else if response_ms <= settings.degraded_up_to_ms {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

fn initialize_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcp-librarian", "version": env!("CARGO_PKG_VERSION")}
        }
    })
}

fn tools_list_payload() -> String {
    let messages = [
        initialize_request(),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
    ];
    messages
        .iter()
        .map(|message| format!("{message}\n"))
        .collect()
}

/// Finds the JSON-RPC response with `id` among newline-delimited stdout.
pub fn find_response(stdout: &str, id: u64) -> Option<Value> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(|value| value.get("id").and_then(Value::as_u64) == Some(id))
}

fn rpc_result(stdout: &str, stderr: &str, id: u64, method: &str) -> Result<Value, String> {
    let Some(response) = find_response(stdout, id) else {
        let snippet: String = stdout.chars().take(200).collect();
        let detail = if snippet.trim().is_empty() {
            stderr.lines().last().unwrap_or("empty stdout").to_string()
        } else {
            snippet
        };
        return Err(format!("no JSON-RPC response to {method}: {detail}"));
    };
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(format!("{method} returned an error: {message}"));
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| format!("{method} response has no result"))
}

fn service_is_running(rows: &[ServiceState], service: &str) -> Result<(), String> {
    let row = rows
        .iter()
        .find(|row| row.is_service(service))
        .ok_or_else(|| format!("service '{service}' is not running"))?;
    if row.is_running() {
        Ok(())
    } else {
        let state = if row.state.is_empty() { &row.status } else { &row.state };
        Err(format!("service '{service}' state is '{}'", state.to_lowercase()))
    }
}

/// Runs the four levels in order, short-circuiting on the first failure.
pub struct HealthChecker<'a, R: DockerRunner + ?Sized> {
    runner: &'a R,
    settings: &'a HealthSettings,
}

impl<'a, R: DockerRunner + ?Sized> HealthChecker<'a, R> {
    pub fn new(runner: &'a R, settings: &'a HealthSettings) -> Self {
        Self { runner, settings }
    }

    fn probe(&self, target: &HealthTarget, args: &[String], stdin: Option<&str>) -> Result<RunOutcome, String> {
        self.runner
            .run(
                args,
                &target.compose.working_dir(),
                stdin.map(str::as_bytes),
                Some(self.settings.level_timeout()),
            )
            .map_err(|err| format!("failed to run `{}`: {err}", command_line(args)))
    }

    fn check_container(&self, target: &HealthTarget) -> Result<(), String> {
        let args = target
            .compose
            .args(&["ps", "--format", "json", &target.compose.service]);
        match self.probe(target, &args, None)? {
            RunOutcome::TimedOut { .. } => Err("docker compose ps timed out".to_string()),
            RunOutcome::Completed(output) if !output.success() => {
                Err(format!("docker compose ps failed: {}", output.stderr_text()))
            }
            RunOutcome::Completed(output) => {
                let rows = service_states(&output.stdout_text());
                service_is_running(&rows, &target.compose.service)
            }
        }
    }

    /// Returns the initialize round-trip time.
    fn check_protocol(&self, target: &HealthTarget) -> Result<u64, (String, u64)> {
        let args = target.compose.stdio_launch_args();
        let payload = format!("{}\n", initialize_request());
        match self.probe(target, &args, Some(&payload)).map_err(|err| (err, 0))? {
            RunOutcome::TimedOut { elapsed } => {
                let ms = elapsed.as_millis() as u64;
                Err((format!("initialize timed out after {ms} ms"), ms))
            }
            RunOutcome::Completed(output) => {
                let ms = output.elapsed.as_millis() as u64;
                let result = rpc_result(&output.stdout_text(), &output.stderr_text(), 1, "initialize")
                    .map_err(|err| (err, ms))?;
                if result.get("protocolVersion").is_none() && result.get("serverInfo").is_none() {
                    return Err(("initialize result lacks protocolVersion".to_string(), ms));
                }
                Ok(ms)
            }
        }
    }

    fn check_tools(&self, target: &HealthTarget) -> Result<Vec<String>, String> {
        let args = target.compose.stdio_launch_args();
        let payload = tools_list_payload();
        let output = match self.probe(target, &args, Some(&payload))? {
            RunOutcome::TimedOut { elapsed } => {
                return Err(format!("tools/list timed out after {} ms", elapsed.as_millis()))
            }
            RunOutcome::Completed(output) => output,
        };
        let result = rpc_result(&output.stdout_text(), &output.stderr_text(), 2, "tools/list")?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| "tools/list result has no tools array".to_string())?;
        if tools.is_empty() {
            return Err("tools/list returned no tools".to_string());
        }
        Ok(tools
            .iter()
            .filter_map(|tool| tool.get("name").and_then(Value::as_str).map(ToString::to_string))
            .collect())
    }

    pub fn check(&self, target: &HealthTarget) -> HealthReport {
        let mut result = HealthCheckResult::new(&target.name);
        let report = |result: HealthCheckResult, tool_names: Vec<String>| HealthReport {
            result,
            tool_names,
            recovered: None,
        };

        if !target.source_path.exists() {
            result.error_message = format!(
                "Source directory not found: {}",
                target.source_path.display()
            );
            debug!(server = %target.name, "source missing; skipping probes");
            return report(result, Vec::new());
        }

        if let Err(err) = self.check_container(target) {
            debug!(server = %target.name, error = %err, "L1 failed");
            return report(result.fail(HealthStatus::Stopped, FailedLevel::L1Container, err), Vec::new());
        }
        result.container_running = true;

        let response_ms = match self.check_protocol(target) {
            Ok(ms) => ms,
            Err((err, ms)) => {
                debug!(server = %target.name, error = %err, "L2 failed");
                result.response_time_ms = ms;
                return report(result.fail(HealthStatus::Unhealthy, FailedLevel::L2Protocol, err), Vec::new());
            }
        };
        result.protocol_responds = true;
        result.response_time_ms = response_ms;

        let tool_names = match self.check_tools(target) {
            Ok(names) => names,
            Err(err) => {
                debug!(server = %target.name, error = %err, "L3 failed");
                return report(result.fail(HealthStatus::Unhealthy, FailedLevel::L3Tools, err), Vec::new());
            }
        };
        result.tools_available = true;
        result.tool_count = tool_names.len();

        result.status = classify_latency(self.settings, response_ms);
        match result.status {
            HealthStatus::Degraded => {
                result.error_message = format!(
                    "initialize took {response_ms} ms (healthy below {} ms)",
                    self.settings.healthy_below_ms
                );
            }
            HealthStatus::Unhealthy => {
                result.failed_level = Some(FailedLevel::L4Latency);
                result.error_message = format!(
                    "initialize took {response_ms} ms, above {} ms",
                    self.settings.degraded_up_to_ms
                );
            }
            _ => {}
        }
        debug!(server = %target.name, status = result.status.as_str(), response_ms, "health check complete");
        report(result, tool_names)
    }

    /// One restart, a fixed wait, then a fresh check. Recovery succeeds when
    /// the container runs and the protocol answers again.
    pub fn recover(&self, target: &HealthTarget) -> HealthReport {
        info!(server = %target.name, "attempting recovery");
        let args = target.compose.args(&["restart", &target.compose.service]);
        let restarted = match self.probe(target, &args, None) {
            Ok(RunOutcome::Completed(output)) if output.success() => true,
            Ok(RunOutcome::Completed(output)) => {
                debug!(stderr = %output.stderr_text(), "restart failed");
                false
            }
            Ok(RunOutcome::TimedOut { .. }) | Err(_) => false,
        };
        if !restarted {
            let result = HealthCheckResult::new(&target.name).fail(
                HealthStatus::Unhealthy,
                FailedLevel::L1Container,
                "docker compose restart failed".to_string(),
            );
            return HealthReport {
                result,
                tool_names: Vec::new(),
                recovered: Some(false),
            };
        }
        let wait = self.settings.recovery_wait();
        if wait > Duration::ZERO {
            thread::sleep(wait);
        }
        let mut report = self.check(target);
        let recovered = report.result.container_running && report.result.protocol_responds;
        info!(server = %target.name, recovered, "recovery finished");
        report.recovered = Some(recovered);
        report
    }

    /// Check, and on `unhealthy` attempt a single recovery when allowed.
    pub fn check_and_recover(&self, target: &HealthTarget, recover: bool) -> HealthReport {
        let report = self.check(target);
        if recover && report.result.status == HealthStatus::Unhealthy {
            return self.recover(target);
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::docker::testing::{failed_output, ok_output, ok_output_after, MockDockerRunner};
    use crate::docker::RunOutcome;
    use serde_json::json;
    use std::time::Duration;

    /// Fake MCP server: running container, answering initialize in `latency`
    /// and listing `tools`.
    pub fn mcp_runner(latency: Duration, tools: Vec<&'static str>) -> MockDockerRunner {
        MockDockerRunner::with_responder(move |args, stdin| responder(args, stdin, latency, &tools))
    }

    pub fn responder(args: &[String], stdin: Option<&str>, latency: Duration, tools: &[&str]) -> RunOutcome {
        if args.iter().any(|a| a == "ps") {
            let service = args.last().cloned().unwrap_or_default();
            return ok_output(&json!([{"Service": service, "State": "running"}]).to_string());
        }
        if args.iter().any(|a| a == "run") {
            let stdin = stdin.unwrap_or_default();
            let mut out = String::new();
            if stdin.contains("\"initialize\"") {
                out.push_str(&json!({"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake"},"capabilities":{}}}).to_string());
                out.push('\n');
            }
            if stdin.contains("tools/list") {
                let tools: Vec<_> = tools.iter().map(|name| json!({"name": name, "inputSchema": {}})).collect();
                out.push_str(&json!({"jsonrpc":"2.0","id":2,"result":{"tools": tools}}).to_string());
                out.push('\n');
            }
            return ok_output_after(&out, latency);
        }
        if args.iter().any(|a| a == "restart") {
            return ok_output("");
        }
        failed_output(1, "unexpected docker call")
    }
}
