use crate::error::{LibrarianError, ProcessErrorDetails};
use crate::fsutil::shell_single_quote;
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Result of one blocking docker invocation.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(CommandOutput),
    TimedOut { elapsed: Duration },
}

pub trait DockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, io::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealDockerRunner;

fn spawn_reader<T: Read + Send + 'static>(pipe: Option<T>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, io::Error> {
        let started = Instant::now();
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .current_dir(cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        // Closing stdin after the payload lets stdio servers exit on EOF.
        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(thread::spawn(move || {
                    let _ = pipe.write_all(&bytes);
                    let _ = pipe.flush();
                }))
            }
            _ => None,
        };
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let status = match timeout {
            None => child.wait()?,
            Some(limit) => loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(RunOutcome::TimedOut {
                        elapsed: started.elapsed(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            },
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(RunOutcome::Completed(CommandOutput {
            status_code,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        }))
    }
}

/// A compose project generated for one wrapped server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeTarget {
    pub compose_file: PathBuf,
    pub project: String,
    pub service: String,
}

impl ComposeTarget {
    pub fn new(compose_file: impl Into<PathBuf>, service: &str) -> Self {
        Self {
            compose_file: compose_file.into(),
            project: project_name(service),
            service: service.to_string(),
        }
    }

    pub fn args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.to_string_lossy().to_string(),
            "-p".to_string(),
            self.project.clone(),
        ];
        args.extend(tail.iter().map(|part| (*part).to_string()));
        args
    }

    /// The command platforms use to launch the server over stdio.
    pub fn stdio_launch_args(&self) -> Vec<String> {
        self.args(&["run", "--rm", "-T", &self.service])
    }

    pub fn working_dir(&self) -> PathBuf {
        self.compose_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

pub fn project_name(service: &str) -> String {
    format!("mcp-{service}")
}

/// The docker invocation as a user could paste it into a shell.
pub fn command_line(args: &[String]) -> String {
    let mut line = String::from("docker");
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"$`\\".contains(c)) {
            line.push_str(&shell_single_quote(arg));
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Details for a docker process that could not be started at all, before any
/// compose service was touched.
pub fn spawn_failure(err: &io::Error, command: &str) -> ProcessErrorDetails {
    let (error_code, hint) = match err.kind() {
        io::ErrorKind::NotFound => (
            "docker_not_found",
            Some("Install Docker with the compose plugin and make sure `docker` is on your PATH."),
        ),
        io::ErrorKind::PermissionDenied => (
            "docker_permission_denied",
            Some("Your user may not run docker. Add it to the docker group or run Docker Desktop."),
        ),
        _ => ("process_command_failed", None),
    };
    ProcessErrorDetails {
        error_code: error_code.to_string(),
        hint: hint.map(str::to_string),
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
        || lower.contains("unknown shorthand flag: 'f' in -f")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some(
                "Docker Compose v2 is unavailable. Install the compose plugin so `docker compose version` works."
                    .to_string(),
            ),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("npm ci")
        || lower.contains("npm err")
        || lower.contains("uv pip install")
        || lower.contains("could not find a version that satisfies")
        || lower.contains("no matching distribution")
        || lower.contains("failed to select a version")
    {
        return (
            "docker_build_dependency_install".to_string(),
            Some(
                "Dependency installation failed inside the image. Check the manifest and lockfile, then run `mcp-librarian scan <path> --fix`."
                    .to_string(),
            ),
        );
    }

    if lower.contains("pull access denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication required")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Base image pull was denied. Run `docker login` and retry.".to_string()),
        );
    }

    if lower.contains("no space left on device") {
        return (
            "docker_disk_full".to_string(),
            Some("Docker ran out of disk space. Run `docker system prune` and retry.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Runs docker and converts spawn failures, timeouts and non-zero exits into
/// classified errors.
pub fn execute_docker<R: DockerRunner + ?Sized>(
    runner: &R,
    args: &[String],
    cwd: &Path,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, LibrarianError> {
    let command = command_line(args);
    debug!(command = %command, "running docker");
    let outcome = runner.run(args, cwd, stdin, timeout).map_err(|err| {
        let details = spawn_failure(&err, &command);
        LibrarianError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })?;
    let cmd_output = match outcome {
        RunOutcome::Completed(output) => output,
        RunOutcome::TimedOut { elapsed } => {
            return Err(LibrarianError::ProcessDetailed {
                message: format!(
                    "command `{command}` timed out after {} ms",
                    elapsed.as_millis()
                ),
                details: ProcessErrorDetails {
                    error_code: "docker_timeout".to_string(),
                    hint: Some("The Docker engine did not answer in time; retry once it is idle.".to_string()),
                    command: Some(command),
                    raw_stderr: None,
                },
            })
        }
    };
    if !cmd_output.success() {
        let stderr = cmd_output.stderr_text();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        return Err(LibrarianError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() {
                    None
                } else {
                    Some(stderr)
                },
            },
        });
    }
    Ok(cmd_output)
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceState {
    #[serde(rename = "Service")]
    pub service: String,
    /// Container name, `<project>-<service>-<n>`.
    #[serde(rename = "Name")]
    pub container: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
}

impl ServiceState {
    pub fn is_service(&self, service: &str) -> bool {
        self.service == service || self.container.ends_with(&format!("-{service}-1"))
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.to_lowercase();
        state == "running" || self.status.to_lowercase().starts_with("up")
    }
}

/// Compose prints a JSON array on current releases and one object per line
/// on older ones; rows that do not parse are skipped.
pub fn service_states(text: &str) -> Vec<ServiceState> {
    let text = text.trim();
    if let Ok(rows) = serde_json::from_str::<Vec<ServiceState>>(text) {
        return rows;
    }
    text.lines()
        .filter_map(|line| serde_json::from_str::<ServiceState>(line.trim()).ok())
        .collect()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub args: Vec<String>,
        pub stdin: Option<String>,
        pub timeout: Option<Duration>,
    }

    type Responder = Box<dyn Fn(&[String], Option<&str>) -> RunOutcome + Send + Sync>;

    /// Records every invocation; answers from the queue first, then from the
    /// responder, then with an empty success.
    #[derive(Default)]
    pub struct MockDockerRunner {
        calls: Mutex<Vec<RecordedCall>>,
        outputs: Mutex<VecDeque<RunOutcome>>,
        responder: Option<Responder>,
    }

    impl MockDockerRunner {
        pub fn with_responder<F>(responder: F) -> Self
        where
            F: Fn(&[String], Option<&str>) -> RunOutcome + Send + Sync + 'static,
        {
            Self {
                responder: Some(Box::new(responder)),
                ..Self::default()
            }
        }

        pub fn push_output(&self, outcome: RunOutcome) {
            self.outputs.lock().unwrap().push_back(outcome);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub fn ok_output(stdout: &str) -> RunOutcome {
        ok_output_after(stdout, Duration::from_millis(5))
    }

    pub fn ok_output_after(stdout: &str, elapsed: Duration) -> RunOutcome {
        RunOutcome::Completed(CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            elapsed,
        })
    }

    pub fn failed_output(status_code: i32, stderr: &str) -> RunOutcome {
        RunOutcome::Completed(CommandOutput {
            status_code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            elapsed: Duration::from_millis(5),
        })
    }

    impl DockerRunner for MockDockerRunner {
        fn run(
            &self,
            args: &[String],
            _cwd: &Path,
            stdin: Option<&[u8]>,
            timeout: Option<Duration>,
        ) -> Result<RunOutcome, io::Error> {
            let stdin_text = stdin.map(|bytes| String::from_utf8_lossy(bytes).to_string());
            self.calls.lock().unwrap().push(RecordedCall {
                args: args.to_vec(),
                stdin: stdin_text.clone(),
                timeout,
            });
            if let Some(queued) = self.outputs.lock().unwrap().pop_front() {
                return Ok(queued);
            }
            if let Some(responder) = &self.responder {
                return Ok(responder(args, stdin_text.as_deref()));
            }
            Ok(ok_output(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn compose_target_builds_project_scoped_args() {
        let target = ComposeTarget::new("/cfg/servers/weather/docker-compose.yml", "weather");
        assert_eq!(
            target.args(&["build"]),
            vec![
                "compose",
                "-f",
                "/cfg/servers/weather/docker-compose.yml",
                "-p",
                "mcp-weather",
                "build"
            ]
        );
        assert_eq!(
            target.stdio_launch_args()[5..],
            ["run", "--rm", "-T", "weather"]
        );
        assert_eq!(target.working_dir(), PathBuf::from("/cfg/servers/weather"));
    }

    #[test]
    fn command_line_quotes_paths_with_spaces() {
        let target = ComposeTarget::new("/home/me/My Servers/weather/docker-compose.yml", "weather");
        assert_eq!(
            command_line(&target.args(&["build"])),
            "docker compose -f '/home/me/My Servers/weather/docker-compose.yml' -p mcp-weather build"
        );
    }

    #[test]
    fn classify_recognises_daemon_and_dependency_failures() {
        let (code, hint) =
            classify_docker_command_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.is_some());

        let (code, _) = classify_docker_command_failure(
            "npm ERR! The `npm ci` command can only install with an existing package-lock.json",
        );
        assert_eq!(code, "docker_build_dependency_install");

        let (code, hint) = classify_docker_command_failure("something odd happened");
        assert_eq!(code, "process_command_failed");
        assert!(hint.is_none());
    }

    #[test]
    fn execute_docker_maps_timeout_to_detailed_error() {
        let runner = MockDockerRunner::default();
        runner.push_output(RunOutcome::TimedOut {
            elapsed: Duration::from_secs(10),
        });
        let err = execute_docker(
            &runner,
            &["ps".to_string()],
            Path::new("."),
            None,
            Some(Duration::from_secs(10)),
        )
        .expect_err("timeout must fail");
        assert_eq!(err.details().unwrap().error_code, "docker_timeout");
    }

    #[test]
    fn execute_docker_keeps_stderr_in_details() {
        let runner = MockDockerRunner::default();
        runner.push_output(failed_output(1, "pull access denied for node"));
        let err = execute_docker(&runner, &["build".to_string()], Path::new("."), None, None)
            .expect_err("non-zero exit must fail");
        let details = err.details().unwrap();
        assert_eq!(details.error_code, "docker_registry_auth");
        assert_eq!(
            details.raw_stderr.as_deref(),
            Some("pull access denied for node")
        );
    }

    #[test]
    fn service_states_accept_array_and_line_formats() {
        let array = service_states(
            r#"[{"Service":"weather","Name":"mcp-weather-weather-1","State":"running","Status":"Up 2 minutes"}]"#,
        );
        assert_eq!(array.len(), 1);
        assert!(array[0].is_service("weather"));
        assert!(array[0].is_running());

        let lines = service_states(
            "{\"Service\":\"a\",\"State\":\"running\"}\n{\"Service\":\"b\",\"State\":\"exited\"}\n",
        );
        assert_eq!(lines.len(), 2);
        assert!(!lines[1].is_running());

        assert!(service_states("").is_empty());
        assert!(service_states("null").is_empty());
    }

    #[test]
    fn service_is_matched_by_container_name() {
        let row = ServiceState {
            container: "mcp-notes-notes-1".to_string(),
            status: "Up 3 seconds".to_string(),
            ..ServiceState::default()
        };
        assert!(row.is_service("notes"));
        assert!(!row.is_service("weather"));
        assert!(row.is_running());
    }

    #[test]
    fn spawn_failures_are_classified_by_io_kind() {
        let err = io::Error::new(io::ErrorKind::NotFound, "No such file or directory");
        let details = spawn_failure(&err, "docker compose build");
        assert_eq!(details.error_code, "docker_not_found");
        assert!(details.hint.unwrap().contains("compose plugin"));

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
        assert_eq!(spawn_failure(&err, "docker").error_code, "docker_permission_denied");

        let err = io::Error::new(io::ErrorKind::Other, "boom");
        let details = spawn_failure(&err, "docker");
        assert_eq!(details.error_code, "process_command_failed");
        assert!(details.hint.is_none());
    }
}
