use crate::docker::{execute_docker, ComposeTarget, DockerRunner};
use crate::error::{LibrarianError, ProcessErrorDetails};
use crate::generate::ContainerConfig;
use serde::Serialize;
use tracing::{info, warn};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageRef {
    pub tag: String,
}

pub fn compose_target(config: &ContainerConfig) -> ComposeTarget {
    ComposeTarget::new(&config.compose_file, &config.service)
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Single-attempt `docker compose build` plus container lifecycle helpers.
pub struct DockerBuilder<'a, R: DockerRunner + ?Sized> {
    runner: &'a R,
    verbose: bool,
}

impl<'a, R: DockerRunner + ?Sized> DockerBuilder<'a, R> {
    pub fn new(runner: &'a R, verbose: bool) -> Self {
        Self { runner, verbose }
    }

    pub fn build(&self, config: &ContainerConfig) -> Result<ImageRef, LibrarianError> {
        let target = compose_target(config);
        info!(service = %config.service, image = %config.image, "building image");
        let args = target.args(&["build"]);
        match execute_docker(self.runner, &args, &config.config_dir, None, None) {
            Ok(_) => Ok(ImageRef {
                tag: config.image.clone(),
            }),
            Err(LibrarianError::ProcessDetailed { message, details }) => {
                Err(self.build_error(config, message, details))
            }
            Err(err) => Err(err),
        }
    }

    fn build_error(
        &self,
        config: &ContainerConfig,
        message: String,
        details: ProcessErrorDetails,
    ) -> LibrarianError {
        let error_code = if details.error_code == "process_command_failed" {
            "docker_build_failed".to_string()
        } else {
            details.error_code
        };
        let hint = details.hint.or_else(|| {
            Some(format!(
                "Re-run with --verbose to see the Docker output, or inspect {}.",
                config.dockerfile.display()
            ))
        });
        let raw_stderr = if self.verbose {
            details
                .raw_stderr
                .map(|raw| tail_lines(&raw, STDERR_TAIL_LINES))
        } else {
            None
        };
        LibrarianError::Build {
            message: format!(
                "docker compose build failed for '{}'\n{message}",
                config.service
            ),
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: details.command,
                raw_stderr,
            },
        }
    }

    pub fn start(&self, config: &ContainerConfig) -> Result<(), LibrarianError> {
        let args = compose_target(config).args(&["up", "-d"]);
        execute_docker(self.runner, &args, &config.config_dir, None, None)?;
        info!(service = %config.service, "container started");
        Ok(())
    }

    /// Best-effort `compose down`; failures are logged, never raised.
    pub fn stop(&self, target: &ComposeTarget) -> bool {
        let args = target.args(&["down"]);
        match execute_docker(self.runner, &args, &target.working_dir(), None, None) {
            Ok(_) => true,
            Err(err) => {
                warn!(service = %target.service, error = %err, "docker compose down failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::{failed_output, MockDockerRunner};
    use crate::generate::TemplateVariant;
    use std::path::Path;

    fn config() -> ContainerConfig {
        ContainerConfig::for_service(Path::new("/cfg"), "weather", TemplateVariant::NodeSelfContained)
    }

    #[test]
    fn build_runs_compose_build_for_project() {
        let runner = MockDockerRunner::default();
        let image = DockerBuilder::new(&runner, false).build(&config()).unwrap();
        assert_eq!(image.tag, "mcp-weather:latest");
        let calls = runner.calls();
        assert_eq!(
            calls[0].args,
            vec![
                "compose",
                "-f",
                "/cfg/servers/weather/docker-compose.yml",
                "-p",
                "mcp-weather",
                "build"
            ]
        );
        assert!(calls[0].timeout.is_none());
    }

    #[test]
    fn build_failure_hides_raw_output_unless_verbose() {
        let runner = MockDockerRunner::default();
        runner.push_output(failed_output(1, "step 1\nstep 2\nexecutor failed running [/bin/sh -c npm ci]"));
        let err = DockerBuilder::new(&runner, false).build(&config()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_BUILD);
        assert_eq!(err.code(), "docker_build_dependency_install");
        assert!(err.details().unwrap().raw_stderr.is_none());
        assert!(err.render(false).starts_with("[ERROR] docker compose build failed for 'weather'"));

        runner.push_output(failed_output(1, "exit code: 2"));
        let err = DockerBuilder::new(&runner, true).build(&config()).unwrap_err();
        assert_eq!(err.code(), "docker_build_failed");
        assert_eq!(err.details().unwrap().raw_stderr.as_deref(), Some("exit code: 2"));
    }

    #[test]
    fn stop_swallows_failures() {
        let runner = MockDockerRunner::default();
        runner.push_output(failed_output(1, "no such project"));
        assert!(!DockerBuilder::new(&runner, false).stop(&compose_target(&config())));
        assert_eq!(runner.calls()[0].args.last().map(String::as_str), Some("down"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
