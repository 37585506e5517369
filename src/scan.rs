use crate::config::FixerSettings;
use crate::detect::{self, Detector};
use crate::docker::{execute_docker, DockerRunner};
use crate::error::LibrarianError;
use crate::fsutil::write_if_changed;
use crate::model::{McpServer, PackageManager, Runtime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingPackageLock,
    RuntimeVersionMismatch,
    PathHasSpaces,
    MissingEnvVar,
    MissingEntryPoint,
    InvalidJsonManifest,
    VolumePathNotFound,
    UnknownRuntime,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPackageLock => "missing_package_lock",
            Self::RuntimeVersionMismatch => "runtime_version_mismatch",
            Self::PathHasSpaces => "path_has_spaces",
            Self::MissingEnvVar => "missing_env_var",
            Self::MissingEntryPoint => "missing_entry_point",
            Self::InvalidJsonManifest => "invalid_json_manifest",
            Self::VolumePathNotFound => "volume_path_not_found",
            Self::UnknownRuntime => "unknown_runtime",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    pub auto_fixable: bool,
    pub fix_instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmartScanResult {
    pub source_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<McpServer>,
    pub issues: Vec<Issue>,
    /// Informational findings such as hard-coded credentials.
    pub warnings: Vec<String>,
    pub ready_to_build: bool,
}

impl SmartScanResult {
    fn new(source_path: &Path, server: Option<McpServer>, issues: Vec<Issue>, warnings: Vec<String>) -> Self {
        let ready_to_build = server.is_some()
            && !issues
                .iter()
                .any(|issue| issue.severity == Severity::Blocking && !issue.auto_fixable);
        Self {
            source_path: source_path.to_path_buf(),
            server,
            issues,
            warnings,
            ready_to_build,
        }
    }

    pub fn blocking_unfixable(&self) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == Severity::Blocking && !issue.auto_fixable)
            .collect()
    }

    pub fn auto_fixable(&self) -> Vec<&Issue> {
        self.issues.iter().filter(|issue| issue.auto_fixable).collect()
    }
}

/// Lists unfixable blocking issues with their manual instruction, one per line.
pub fn describe_blocking(issues: &[&Issue]) -> String {
    issues
        .iter()
        .map(|issue| {
            if issue.fix_instruction.is_empty() {
                format!("{}: {}", issue.issue_type.as_str(), issue.description)
            } else {
                format!(
                    "{}: {} ({})",
                    issue.issue_type.as_str(),
                    issue.description,
                    issue.fix_instruction
                )
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Detects and scans `path`. Classification failures become blocking issues
/// instead of errors so `scan` can report them.
pub fn scan_path(path: &Path, detectors: &[Box<dyn Detector>]) -> Result<SmartScanResult, LibrarianError> {
    match detect::detect_server(path, detectors) {
        Ok(server) => Ok(scan(&server)),
        Err(LibrarianError::Detection { issue, message, .. })
            if issue == detect::ISSUE_UNKNOWN_RUNTIME || issue == detect::ISSUE_INVALID_MANIFEST =>
        {
            let issue = if issue == detect::ISSUE_INVALID_MANIFEST {
                Issue {
                    issue_type: IssueType::InvalidJsonManifest,
                    severity: Severity::Blocking,
                    description: message,
                    auto_fixable: false,
                    fix_instruction: "Fix the manifest syntax and re-run the scan".to_string(),
                    affected_path: Some(path.display().to_string()),
                }
            } else {
                Issue {
                    issue_type: IssueType::UnknownRuntime,
                    severity: Severity::Blocking,
                    description: "No recognised runtime: expected pyproject.toml, requirements.txt, a package.json with an @modelcontextprotocol dependency, or a Cargo.toml with an MCP SDK crate".to_string(),
                    auto_fixable: false,
                    fix_instruction: String::new(),
                    affected_path: Some(path.display().to_string()),
                }
            };
            Ok(SmartScanResult::new(path, None, vec![issue], Vec::new()))
        }
        Err(err) => Err(err),
    }
}

pub fn scan(server: &McpServer) -> SmartScanResult {
    let dotenv = detect::parse_env_file(&server.source_path.join(".env"));
    scan_with_env(server, |name| {
        dotenv.get(name).is_some_and(|value| !value.is_empty())
            || std::env::var_os(name).is_some_and(|value| !value.is_empty())
    })
}

/// Runs every check independently; `is_set` answers whether an environment
/// variable is provided.
pub fn scan_with_env<F>(server: &McpServer, is_set: F) -> SmartScanResult
where
    F: Fn(&str) -> bool,
{
    let mut issues = Vec::new();
    issues.extend(check_lockfile(server));
    issues.extend(check_path_spaces(server));
    issues.extend(check_runtime_version(server));
    issues.extend(check_env_vars(server, &is_set));
    issues.extend(check_entry_point(server));
    issues.extend(check_volumes(server));
    debug!(server = %server.name, issues = issues.len(), "smart-scan finished");
    SmartScanResult::new(
        &server.source_path,
        Some(server.clone()),
        issues,
        server.security_warnings.clone(),
    )
}

fn check_lockfile(server: &McpServer) -> Option<Issue> {
    if server.runtime != Runtime::Node || server.has_lockfile {
        return None;
    }
    Some(Issue {
        issue_type: IssueType::MissingPackageLock,
        severity: Severity::Blocking,
        description: "No package-lock.json found; `npm ci` needs a lockfile for reproducible installs".to_string(),
        auto_fixable: true,
        fix_instruction: "Run `npm install --package-lock-only` in the server directory".to_string(),
        affected_path: Some(server.source_path.display().to_string()),
    })
}

fn check_path_spaces(server: &McpServer) -> Option<Issue> {
    let component = server
        .source_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .find(|part| part.chars().any(char::is_whitespace))?;
    Some(Issue {
        issue_type: IssueType::PathHasSpaces,
        severity: Severity::Warning,
        description: format!(
            "Path component '{component}' contains whitespace, which breaks short-syntax volume mounts"
        ),
        auto_fixable: true,
        fix_instruction: "Use long-syntax volume mounts in docker-compose.yml, or move the server to a path without spaces".to_string(),
        affected_path: Some(server.source_path.display().to_string()),
    })
}

/// Manifest constraint and version-file pin, when both are present.
fn declared_versions(server: &McpServer) -> Option<(String, String, &'static str)> {
    let root = &server.source_path;
    match server.runtime {
        Runtime::Node => {
            let pkg: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(root.join("package.json")).ok()?).ok()?;
            let manifest = pkg
                .get("engines")
                .and_then(|e| e.get("node"))
                .and_then(serde_json::Value::as_str)
                .and_then(detect::extract_version)?;
            for file in [".nvmrc", ".node-version"] {
                if let Some(pinned) = fs::read_to_string(root.join(file))
                    .ok()
                    .and_then(|raw| detect::extract_version(&raw))
                {
                    return Some((manifest, pinned, file));
                }
            }
            None
        }
        Runtime::Python => {
            let pinned = fs::read_to_string(root.join(".python-version"))
                .ok()
                .and_then(|raw| detect::extract_version(&raw))?;
            let table: toml::Table =
                toml::from_str(&fs::read_to_string(root.join("pyproject.toml")).ok()?).ok()?;
            let manifest = table
                .get("project")
                .and_then(|p| p.get("requires-python"))
                .and_then(toml::Value::as_str)
                .and_then(detect::extract_version)?;
            Some((manifest, pinned, ".python-version"))
        }
        Runtime::Rust | Runtime::Unknown => None,
    }
}

fn check_runtime_version(server: &McpServer) -> Option<Issue> {
    let (manifest, pinned, file) = declared_versions(server)?;
    let same = match server.runtime {
        // Python compatibility is decided at minor granularity.
        Runtime::Python => {
            let minor = |v: &str| v.split('.').take(2).collect::<Vec<_>>().join(".");
            minor(&manifest) == minor(&pinned)
        }
        _ => detect::version_major(&manifest) == detect::version_major(&pinned),
    };
    if same {
        return None;
    }
    Some(Issue {
        issue_type: IssueType::RuntimeVersionMismatch,
        severity: Severity::Warning,
        description: format!(
            "Manifest declares {} {manifest} but {file} pins {pinned}; the image uses {}",
            server.runtime, server.runtime_version
        ),
        auto_fixable: true,
        fix_instruction: format!("Align {file} with the manifest version"),
        affected_path: Some(server.source_path.join(file).display().to_string()),
    })
}

fn check_env_vars<F>(server: &McpServer, is_set: &F) -> Vec<Issue>
where
    F: Fn(&str) -> bool,
{
    server
        .env_vars
        .iter()
        .filter(|var| var.required && !is_set(&var.name))
        .map(|var| Issue {
            issue_type: IssueType::MissingEnvVar,
            severity: Severity::Warning,
            description: format!("Required environment variable {} is not set", var.name),
            auto_fixable: false,
            fix_instruction: format!(
                "Add {}={} to the generated .env file before starting the server",
                var.name, var.masked_example
            ),
            affected_path: None,
        })
        .collect()
}

fn check_entry_point(server: &McpServer) -> Option<Issue> {
    if server.entry_point.is_empty() {
        return Some(Issue {
            issue_type: IssueType::MissingEntryPoint,
            severity: Severity::Blocking,
            description: "Could not determine the server entry point".to_string(),
            auto_fixable: false,
            fix_instruction: match server.runtime {
                Runtime::Python => "Add [project.scripts], main.py, or src/<pkg>/server.py".to_string(),
                _ => "Declare the entry point in the manifest".to_string(),
            },
            affected_path: Some(server.source_path.display().to_string()),
        });
    }
    let is_file_entry = match server.runtime {
        Runtime::Node => !server.has_build_step,
        Runtime::Python => server.package_manager == PackageManager::Pip,
        Runtime::Rust | Runtime::Unknown => false,
    };
    if is_file_entry && !server.source_path.join(&server.entry_point).is_file() {
        return Some(Issue {
            issue_type: IssueType::MissingEntryPoint,
            severity: Severity::Blocking,
            description: format!("Entry point {} does not exist", server.entry_point),
            auto_fixable: false,
            fix_instruction: "Create the entry point file or fix `main`/`bin` in the manifest".to_string(),
            affected_path: Some(server.source_path.join(&server.entry_point).display().to_string()),
        });
    }
    None
}

fn check_volumes(server: &McpServer) -> Vec<Issue> {
    server
        .data_volumes
        .iter()
        .filter(|volume| !volume.host_path.is_dir())
        .map(|volume| Issue {
            issue_type: IssueType::VolumePathNotFound,
            severity: Severity::Warning,
            description: format!("Data directory {} does not exist", volume.host_path.display()),
            auto_fixable: false,
            fix_instruction: "Mount the drive or create the directory before starting the server".to_string(),
            affected_path: Some(volume.host_path.display().to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fix {
    pub issue_type: IssueType,
    pub description: String,
    pub files_modified: Vec<String>,
    pub reversible: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Fix {
    fn ok(issue_type: IssueType, description: String, files_modified: Vec<String>) -> Self {
        Self {
            issue_type,
            description,
            files_modified,
            reversible: true,
            success: true,
            error: None,
        }
    }

    fn failed(issue_type: IssueType, description: &str, error: String) -> Self {
        Self {
            issue_type,
            description: description.to_string(),
            files_modified: Vec::new(),
            reversible: true,
            success: false,
            error: Some(error),
        }
    }
}

/// Applies the auto-fixable subset of a scan. Each fix runs in isolation; a
/// failed fix is recorded, never raised.
pub struct Fixer<'a, R: DockerRunner + ?Sized> {
    runner: &'a R,
    settings: &'a FixerSettings,
}

impl<'a, R: DockerRunner + ?Sized> Fixer<'a, R> {
    pub fn new(runner: &'a R, settings: &'a FixerSettings) -> Self {
        Self { runner, settings }
    }

    pub fn fix_all(&self, result: &SmartScanResult, compose_file: Option<&Path>) -> Vec<Fix> {
        let Some(server) = result.server.as_ref() else {
            return Vec::new();
        };
        let mut fixes = Vec::new();
        for issue in result.auto_fixable() {
            let fix = match issue.issue_type {
                IssueType::MissingPackageLock => self.fix_missing_lockfile(server),
                IssueType::PathHasSpaces => fix_path_has_spaces(server, compose_file),
                IssueType::RuntimeVersionMismatch => Fix::ok(
                    IssueType::RuntimeVersionMismatch,
                    format!(
                        "Using detected {} version {} for the image",
                        server.runtime, server.runtime_version
                    ),
                    Vec::new(),
                ),
                other => {
                    warn!(issue = other.as_str(), "no fix strategy for auto-fixable issue");
                    continue;
                }
            };
            if fix.success {
                info!(issue = fix.issue_type.as_str(), "applied fix");
            } else {
                warn!(issue = fix.issue_type.as_str(), error = ?fix.error, "fix failed");
            }
            fixes.push(fix);
        }
        fixes
    }

    fn fix_missing_lockfile(&self, server: &McpServer) -> Fix {
        const DESCRIPTION: &str = "Generate package-lock.json in a disposable Node container";
        let version = if server.runtime_version.trim().is_empty() {
            self.settings.default_node_version.clone()
        } else {
            server.runtime_version.clone()
        };
        let image = format!("node:{version}-slim");
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/app", server.source_path.display()),
            "-w".to_string(),
            "/app".to_string(),
            image.clone(),
            "npm".to_string(),
            "install".to_string(),
            "--package-lock-only".to_string(),
        ];
        if let Err(err) = execute_docker(
            self.runner,
            &args,
            &server.source_path,
            None,
            Some(self.settings.lockfile_timeout()),
        ) {
            return Fix::failed(IssueType::MissingPackageLock, DESCRIPTION, err.summary());
        }
        let lockfile = server.source_path.join("package-lock.json");
        if !lockfile.is_file() {
            return Fix::failed(
                IssueType::MissingPackageLock,
                DESCRIPTION,
                format!("{image} finished but package-lock.json was not written"),
            );
        }
        Fix::ok(
            IssueType::MissingPackageLock,
            format!("Generated package-lock.json with {image}"),
            vec![lockfile.display().to_string()],
        )
    }
}

fn fix_path_has_spaces(server: &McpServer, compose_file: Option<&Path>) -> Fix {
    let Some(compose_file) = compose_file.filter(|path| path.is_file()) else {
        return Fix::ok(
            IssueType::PathHasSpaces,
            "Generated compose files use long-syntax mounts for this path".to_string(),
            Vec::new(),
        );
    };
    match rewrite_volumes_long_syntax(compose_file) {
        Ok(true) => Fix::ok(
            IssueType::PathHasSpaces,
            format!("Rewrote volume mounts of {} to long syntax", server.service_name()),
            vec![compose_file.display().to_string()],
        ),
        Ok(false) => Fix::ok(
            IssueType::PathHasSpaces,
            "Volume mounts already use long syntax".to_string(),
            Vec::new(),
        ),
        Err(err) => Fix::failed(
            IssueType::PathHasSpaces,
            "Rewrite volume mounts to long syntax",
            err.to_string(),
        ),
    }
}

/// `src:dst[:ro]` to `{type: bind, source, target, read_only}`.
fn long_volume(short: &str) -> Option<serde_yaml::Value> {
    let (rest, read_only) = match short.rsplit_once(':') {
        Some((rest, "ro")) => (rest, true),
        Some((rest, "rw")) => (rest, false),
        _ => (short, false),
    };
    let (source, target) = rest.rsplit_once(':')?;
    if !target.starts_with('/') || source.is_empty() {
        return None;
    }
    let mut map = serde_yaml::Mapping::new();
    map.insert("type".into(), "bind".into());
    map.insert("source".into(), source.into());
    map.insert("target".into(), target.into());
    map.insert("read_only".into(), read_only.into());
    Some(serde_yaml::Value::Mapping(map))
}

pub fn rewrite_volumes_long_syntax(compose_file: &Path) -> Result<bool, LibrarianError> {
    let content = fs::read_to_string(compose_file)?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let mut changed = false;
    if let Some(services) = doc
        .get_mut("services")
        .and_then(serde_yaml::Value::as_mapping_mut)
    {
        for (_, service) in services.iter_mut() {
            let Some(volumes) = service
                .get_mut("volumes")
                .and_then(serde_yaml::Value::as_sequence_mut)
            else {
                continue;
            };
            for volume in volumes.iter_mut() {
                if let Some(long) = volume.as_str().and_then(long_volume) {
                    *volume = long;
                    changed = true;
                }
            }
        }
    }
    if !changed {
        return Ok(false);
    }
    write_if_changed(compose_file, &serde_yaml::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::fixtures::{node_server, python_server};
    use crate::detect::{default_detectors, NodeDetector};
    use crate::docker::testing::{failed_output, ok_output, MockDockerRunner};
    use crate::docker::RunOutcome;
    use tempfile::tempdir;

    fn types(result: &SmartScanResult) -> Vec<IssueType> {
        result.issues.iter().map(|i| i.issue_type).collect()
    }

    #[test]
    fn missing_lockfile_is_blocking_but_fixable() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), false);
        let server = NodeDetector.detect(dir.path()).unwrap();
        let result = scan_with_env(&server, |_| true);
        assert_eq!(types(&result), vec![IssueType::MissingPackageLock]);
        assert_eq!(result.issues[0].severity, Severity::Blocking);
        assert!(result.ready_to_build);
    }

    #[test]
    fn missing_required_env_var_is_a_warning() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), true);
        let server = NodeDetector.detect(dir.path()).unwrap();
        let result = scan_with_env(&server, |name| name != "WEATHER_API_KEY");
        assert_eq!(types(&result), vec![IssueType::MissingEnvVar]);
        assert!(result.issues[0].fix_instruction.contains("WEATHER_API_KEY="));
        assert!(result.ready_to_build);
    }

    #[test]
    fn dotenv_in_source_satisfies_required_vars() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), true);
        fs::write(dir.path().join(".env"), "WEATHER_API_KEY=abc\n").unwrap();
        let server = NodeDetector.detect(dir.path()).unwrap();
        let result = scan(&server);
        assert!(!types(&result).contains(&IssueType::MissingEnvVar));
    }

    #[test]
    fn path_with_spaces_is_reported() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("My Servers").join("weather");
        node_server(&root, true);
        let server = NodeDetector.detect(&root).unwrap();
        let result = scan_with_env(&server, |_| true);
        assert_eq!(types(&result), vec![IssueType::PathHasSpaces]);
        assert!(result.issues[0].description.contains("My Servers"));
    }

    #[test]
    fn node_version_mismatch_against_nvmrc() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), true);
        fs::write(dir.path().join(".nvmrc"), "18\n").unwrap();
        let server = NodeDetector.detect(dir.path()).unwrap();
        let result = scan_with_env(&server, |_| true);
        assert_eq!(types(&result), vec![IssueType::RuntimeVersionMismatch]);
        assert!(result.issues[0].auto_fixable);
    }

    #[test]
    fn python_version_file_matching_manifest_is_clean() {
        let dir = tempdir().unwrap();
        python_server(dir.path());
        fs::write(dir.path().join(".python-version"), "3.12.4\n").unwrap();
        let server = crate::detect::PythonDetector.detect(dir.path()).unwrap();
        assert!(scan_with_env(&server, |_| true).issues.is_empty());
    }

    #[test]
    fn missing_entry_file_blocks_build() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), true);
        fs::remove_file(dir.path().join("index.js")).unwrap();
        let server = NodeDetector.detect(dir.path()).unwrap();
        let result = scan_with_env(&server, |_| true);
        assert_eq!(types(&result), vec![IssueType::MissingEntryPoint]);
        assert!(!result.ready_to_build);
        assert!(describe_blocking(&result.blocking_unfixable()).contains("missing_entry_point"));
    }

    #[test]
    fn scan_path_reports_unknown_runtime_as_issue() {
        let dir = tempdir().unwrap();
        let result = scan_path(dir.path(), &default_detectors()).unwrap();
        assert_eq!(types(&result), vec![IssueType::UnknownRuntime]);
        assert!(result.server.is_none());
        assert!(!result.ready_to_build);
    }

    #[test]
    fn lockfile_fix_runs_npm_in_container_and_is_idempotent() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), false);
        let root = dir.path().to_path_buf();
        let lock_root = root.clone();
        let runner = MockDockerRunner::with_responder(move |args, _| {
            if args.iter().any(|a| a == "--package-lock-only") {
                fs::write(lock_root.join("package-lock.json"), "{\"lockfileVersion\":3}").unwrap();
            }
            ok_output("")
        });
        let settings = FixerSettings::default();
        let fixer = Fixer::new(&runner, &settings);

        let server = NodeDetector.detect(&root).unwrap();
        let first = scan_with_env(&server, |_| true);
        let fixes = fixer.fix_all(&first, None);
        assert_eq!(fixes.len(), 1);
        assert!(fixes[0].success);
        assert_eq!(fixes[0].files_modified.len(), 1);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.contains(&"node:20-slim".to_string()));
        assert!(calls[0].args.contains(&format!("{}:/app", root.display())));

        let server = NodeDetector.detect(&root).unwrap();
        let second = scan_with_env(&server, |_| true);
        assert!(fixer.fix_all(&second, None).is_empty());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn failed_lockfile_fix_is_recorded() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), false);
        let runner = MockDockerRunner::default();
        runner.push_output(failed_output(1, "npm ERR! 404 Not Found"));
        let settings = FixerSettings::default();
        let server = NodeDetector.detect(dir.path()).unwrap();
        let fixes = Fixer::new(&runner, &settings).fix_all(&scan_with_env(&server, |_| true), None);
        assert!(!fixes[0].success);
        assert!(fixes[0].error.is_some());
    }

    #[test]
    fn lockfile_fix_timeout_is_recorded() {
        let dir = tempdir().unwrap();
        node_server(dir.path(), false);
        let runner = MockDockerRunner::default();
        runner.push_output(RunOutcome::TimedOut {
            elapsed: std::time::Duration::from_secs(120),
        });
        let settings = FixerSettings::default();
        let server = NodeDetector.detect(dir.path()).unwrap();
        let fixes = Fixer::new(&runner, &settings).fix_all(&scan_with_env(&server, |_| true), None);
        assert!(fixes[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(runner.calls()[0].timeout, Some(settings.lockfile_timeout()));
    }

    #[test]
    fn compose_volumes_are_rewritten_once() {
        let dir = tempdir().unwrap();
        let compose = dir.path().join("docker-compose.yml");
        fs::write(
            &compose,
            "services:\n  weather:\n    image: mcp-weather:latest\n    volumes:\n      - /home/me/My Data:/data/my-data:ro\n      - type: bind\n        source: /srv/x\n        target: /data/x\n",
        )
        .unwrap();
        assert!(rewrite_volumes_long_syntax(&compose).unwrap());
        let doc: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(&compose).unwrap()).unwrap();
        let first = &doc["services"]["weather"]["volumes"][0];
        assert_eq!(first["source"].as_str(), Some("/home/me/My Data"));
        assert_eq!(first["target"].as_str(), Some("/data/my-data"));
        assert_eq!(first["read_only"].as_bool(), Some(true));
        assert!(!rewrite_volumes_long_syntax(&compose).unwrap());
    }
}
