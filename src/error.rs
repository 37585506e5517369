use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_DETECTION: i32 = 10;
pub const EXIT_BLOCKING_ISSUE: i32 = 11;
pub const EXIT_BUILD: i32 = 12;
pub const EXIT_HEALTH: i32 = 13;
pub const EXIT_REGISTRY: i32 = 14;
pub const EXIT_PLATFORM_CONFIG: i32 = 15;
pub const EXIT_ALREADY_REGISTERED: i32 = 16;

#[derive(Debug, Error)]
pub enum LibrarianError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("template error: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("render error: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("detection failed for {path}: {message}")]
    Detection {
        path: PathBuf,
        issue: String,
        message: String,
    },
    #[error("blocking issues prevent the build: {0}")]
    BlockingIssues(String),
    #[error("build failed: {message}")]
    Build {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("health check failed: {0}")]
    Health(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("{platform} config update failed: {message}")]
    PlatformConfig {
        platform: String,
        message: String,
        /// Set when the server was registered before the update failed.
        retry: Option<String>,
    },
    #[error("server '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("server '{0}' is not registered")]
    NotRegistered(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("{0}")]
    Batch(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl LibrarianError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Detection { .. } => EXIT_DETECTION,
            Self::BlockingIssues(_) => EXIT_BLOCKING_ISSUE,
            Self::Build { .. } => EXIT_BUILD,
            Self::Health(_) => EXIT_HEALTH,
            Self::Registry(_) | Self::NotRegistered(_) => EXIT_REGISTRY,
            Self::PlatformConfig { .. } => EXIT_PLATFORM_CONFIG,
            Self::AlreadyRegistered(_) => EXIT_ALREADY_REGISTERED,
            _ => EXIT_FAILURE,
        }
    }

    /// Stable machine-readable code used in JSON output and batch summaries.
    pub fn code(&self) -> String {
        match self {
            Self::Detection { issue, .. } => issue.clone(),
            Self::BlockingIssues(_) => "blocking_issue".to_string(),
            Self::Build { details, .. } | Self::ProcessDetailed { details, .. } => {
                details.error_code.clone()
            }
            Self::Health(_) => "health_failed".to_string(),
            Self::Registry(_) => "registry_failed".to_string(),
            Self::NotRegistered(_) => "not_registered".to_string(),
            Self::PlatformConfig { .. } => "platform_config_failed".to_string(),
            Self::AlreadyRegistered(_) => "already_registered".to_string(),
            Self::Config(_) => "config_invalid".to_string(),
            _ => "failed".to_string(),
        }
    }

    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::Build { details, .. } | Self::ProcessDetailed { details, .. } => {
                Some(details.clone())
            }
            _ => None,
        }
    }

    /// One-line summary shown after `[ERROR]`.
    pub fn summary(&self) -> String {
        match self {
            Self::Build { message, .. } | Self::ProcessDetailed { message, .. } => {
                message.lines().next().unwrap_or_default().to_string()
            }
            other => other.to_string(),
        }
    }

    /// Concrete next step shown after the arrow.
    pub fn next_step(&self) -> String {
        if let Some(hint) = self.details().and_then(|details| details.hint) {
            return hint;
        }
        match self {
            Self::Config(_) => {
                "Fix config.yaml in the config directory, or run `mcp-librarian config init`."
                    .to_string()
            }
            Self::Detection { issue, .. } if issue == "invalid_json_manifest" => {
                "Fix the syntax of package.json and re-run.".to_string()
            }
            Self::Detection { .. } => {
                "Point at a directory containing pyproject.toml, requirements.txt, a package.json with an MCP SDK dependency, or a Cargo.toml with an MCP SDK crate."
                    .to_string()
            }
            Self::BlockingIssues(_) => {
                "Apply the manual fixes listed above, then run `mcp-librarian scan <path>` again."
                    .to_string()
            }
            Self::Build { .. } => "Re-run with --verbose to see the Docker build output.".to_string(),
            Self::Health(_) => {
                "Inspect the container with `docker compose logs`, or run `mcp-librarian health <name> --recover`."
                    .to_string()
            }
            Self::Registry(_) => {
                "Check permissions on the config directory (see MCP_LIBRARIAN_HOME).".to_string()
            }
            Self::NotRegistered(_) => "Run `mcp-librarian list` to see registered servers.".to_string(),
            Self::PlatformConfig {
                retry: Some(command),
                ..
            } => format!(
                "The server is registered. Repair the platform config file, then run `{command}` to finish."
            ),
            Self::PlatformConfig { .. } => {
                "Repair the platform config file (a .bak copy is kept next to it) and retry."
                    .to_string()
            }
            Self::AlreadyRegistered(name) => {
                format!("Pass --force to re-wrap, or run `mcp-librarian remove {name}` first.")
            }
            Self::Batch(_) => "See the summary table above for per-server failures.".to_string(),
            _ => "Re-run with --verbose for more detail.".to_string(),
        }
    }

    /// Human-facing rendering: `[ERROR] <summary>` plus `→ <next step>`.
    pub fn render(&self, verbose: bool) -> String {
        let mut out = format!("[ERROR] {}\n→ {}", self.summary(), self.next_step());
        if verbose {
            if let Some(raw) = self.details().and_then(|details| details.raw_stderr) {
                out.push_str("\n\n");
                out.push_str(&raw);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_error(raw: Option<&str>) -> LibrarianError {
        LibrarianError::Build {
            message: "docker compose build failed for 'weather'\nstep 3/7".to_string(),
            details: ProcessErrorDetails {
                error_code: "docker_build_failed".to_string(),
                hint: Some("Check the Dockerfile".to_string()),
                command: Some("docker compose build".to_string()),
                raw_stderr: raw.map(ToString::to_string),
            },
        }
    }

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let errors = [
            LibrarianError::Detection {
                path: PathBuf::from("/tmp/x"),
                issue: "unknown_runtime".to_string(),
                message: "no manifest".to_string(),
            },
            LibrarianError::BlockingIssues("missing entry point".to_string()),
            build_error(None),
            LibrarianError::Health("unhealthy".to_string()),
            LibrarianError::Registry("denied".to_string()),
            LibrarianError::PlatformConfig {
                platform: "cursor".to_string(),
                message: "parse".to_string(),
                retry: None,
            },
            LibrarianError::AlreadyRegistered("weather".to_string()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(LibrarianError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn render_uses_first_line_and_hint() {
        let rendered = build_error(Some("npm ERR! 404")).render(false);
        assert_eq!(
            rendered,
            "[ERROR] docker compose build failed for 'weather'\n→ Check the Dockerfile"
        );
    }

    #[test]
    fn render_includes_raw_output_only_when_verbose() {
        let err = build_error(Some("npm ERR! 404"));
        assert!(!err.render(false).contains("npm ERR!"));
        assert!(err.render(true).contains("npm ERR! 404"));
    }

    #[test]
    fn already_registered_suggests_force() {
        let err = LibrarianError::AlreadyRegistered("weather".to_string());
        assert!(err.render(false).contains("--force"));
        assert_eq!(err.code(), "already_registered");
    }

    #[test]
    fn platform_failure_after_registration_names_the_rerun() {
        let err = LibrarianError::PlatformConfig {
            platform: "cursor".to_string(),
            message: "invalid JSON at line 2 column 1".to_string(),
            retry: Some("mcp-librarian wrap /srv/weather --platform cursor --force".to_string()),
        };
        let rendered = err.render(false);
        assert!(rendered.contains("The server is registered"));
        assert!(rendered.contains("--platform cursor --force"));
        assert_eq!(err.exit_code(), EXIT_PLATFORM_CONFIG);
    }
}
