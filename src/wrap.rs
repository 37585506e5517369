use crate::build::{compose_target, DockerBuilder};
use crate::config::{Config, MAX_WORKERS};
use crate::detect::{self, Detector};
use crate::docker::{spawn_failure, DockerRunner};
use crate::error::LibrarianError;
use crate::fsutil::shell_single_quote;
use crate::generate::{ContainerConfig, Generator, RenderedConfig, TemplateVariant};
use crate::health::{HealthCheckResult, HealthChecker, HealthReport, HealthStatus};
use crate::model::{service_name, Runtime};
use crate::platforms::{PlatformChange, PlatformId, PlatformManager};
use crate::registry::{RegistryEntry, RegistryStore};
use crate::scan::{self, describe_blocking, Fix, Fixer, Severity};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    pub name: Option<String>,
    pub platforms: Vec<PlatformId>,
    pub skip_health_check: bool,
    pub skip_register: bool,
    pub force: bool,
    pub dry_run: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrapReport {
    pub name: String,
    pub source_path: PathBuf,
    pub runtime: Runtime,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub fixes: Vec<Fix>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered: Option<bool>,
    pub registered: bool,
    pub platforms: Vec<PlatformChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<RenderedConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub path: PathBuf,
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub root: PathBuf,
    pub workers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub name: String,
    pub container_stopped: bool,
    pub platforms: Vec<PlatformChange>,
    pub config_removed: bool,
    pub source_path: PathBuf,
}

/// `docker` must be on PATH before any pipeline work starts.
pub fn ensure_docker_available() -> Result<PathBuf, LibrarianError> {
    which::which("docker").map_err(|err| {
        let io_err = io::Error::new(io::ErrorKind::NotFound, err.to_string());
        LibrarianError::ProcessDetailed {
            message: "docker was not found on PATH".to_string(),
            details: spawn_failure(&io_err, "docker"),
        }
    })
}

pub fn validate_workers(workers: usize) -> Result<usize, LibrarianError> {
    if (1..=MAX_WORKERS).contains(&workers) {
        Ok(workers)
    } else {
        Err(LibrarianError::Config(format!(
            "workers must be between 1 and {MAX_WORKERS}, got {workers}"
        )))
    }
}

fn canonical_source(path: &Path) -> Result<PathBuf, LibrarianError> {
    fs::canonicalize(path).map_err(|err| LibrarianError::Detection {
        path: path.to_path_buf(),
        issue: detect::ISSUE_PATH_NOT_FOUND.to_string(),
        message: format!("cannot open directory: {err}"),
    })
}

/// Everything a pipeline run needs, borrowed for the duration of a command.
pub struct Librarian<'a, R: DockerRunner + ?Sized> {
    pub runner: &'a R,
    pub config: &'a Config,
    pub config_root: &'a Path,
    pub store: &'a RegistryStore,
    pub platforms: &'a PlatformManager,
    pub detectors: &'a [Box<dyn Detector>],
    pub generator: &'a Generator,
}

impl<'a, R: DockerRunner + ?Sized> Librarian<'a, R> {
    fn target_platforms(&self, requested: &[PlatformId]) -> Vec<PlatformId> {
        let mut ids = if requested.is_empty() {
            self.config.default_platforms.clone()
        } else {
            requested.to_vec()
        };
        ids.sort();
        ids.dedup();
        ids
    }

    /// Detect, scan, fix, generate, build, start, health-check, register and
    /// update platform configs, stopping at the first terminal failure.
    pub fn wrap(&self, path: &Path, opts: &WrapOptions) -> Result<WrapReport, LibrarianError> {
        let source = canonical_source(path)?;
        let server = detect::detect_server(&source, self.detectors)?;
        let name = opts
            .name
            .as_deref()
            .map(service_name)
            .unwrap_or_else(|| server.service_name());
        info!(server = %name, runtime = %server.runtime, "detected");

        if !opts.skip_register && !opts.force && self.store.get(&name)?.is_some() {
            return Err(LibrarianError::AlreadyRegistered(name));
        }

        let scanned = scan::scan(&server);
        let blocking = scanned.blocking_unfixable();
        if !blocking.is_empty() {
            return Err(LibrarianError::BlockingIssues(describe_blocking(&blocking)));
        }

        let mut report = WrapReport {
            name: name.clone(),
            source_path: source.clone(),
            runtime: server.runtime,
            dry_run: opts.dry_run,
            config_dir: None,
            image: None,
            fixes: Vec::new(),
            warnings: scanned.warnings.clone(),
            health: None,
            recovered: None,
            registered: false,
            platforms: Vec::new(),
            rendered: None,
        };

        if opts.dry_run {
            let rendered = self.generator.render(&server, &name, self.config_root)?;
            report.config_dir = Some(rendered.config.config_dir.clone());
            report.image = Some(rendered.config.image.clone());
            report.rendered = Some(rendered);
            return Ok(report);
        }

        let planned = ContainerConfig::for_service(
            self.config_root,
            &name,
            TemplateVariant::for_server(&server)?,
        );
        let fixer = Fixer::new(self.runner, &self.config.fixer);
        report.fixes = fixer.fix_all(&scanned, Some(&planned.compose_file));

        let server = if report.fixes.is_empty() {
            server
        } else {
            let rescanned = scan::scan_path(&source, self.detectors)?;
            let remaining: Vec<_> = rescanned
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Blocking)
                .collect();
            if !remaining.is_empty() {
                let failures: Vec<String> = report
                    .fixes
                    .iter()
                    .filter_map(|fix| fix.error.clone())
                    .collect();
                let mut message = describe_blocking(&remaining);
                if !failures.is_empty() {
                    message.push_str(&format!("; fix failed: {}", failures.join("; ")));
                }
                return Err(LibrarianError::BlockingIssues(message));
            }
            rescanned.server.ok_or_else(|| LibrarianError::Detection {
                path: source.clone(),
                issue: detect::ISSUE_UNKNOWN_RUNTIME.to_string(),
                message: "server could not be detected after fixes".to_string(),
            })?
        };

        let container = self.generator.generate(&server, &name, self.config_root)?;
        report.config_dir = Some(container.config_dir.clone());

        let builder = DockerBuilder::new(self.runner, opts.verbose);
        let image = builder.build(&container)?;
        report.image = Some(image.tag);
        builder.start(&container)?;

        let mut entry = RegistryEntry::new(&source, server.runtime, &container);
        if !opts.skip_health_check {
            let checker = HealthChecker::new(self.runner, &self.config.health);
            let health = checker.check_and_recover(&entry.health_target(), true);
            report.recovered = health.recovered;
            report.health = Some(health.result.clone());
            if !matches!(health.result.status, HealthStatus::Healthy | HealthStatus::Degraded) {
                return Err(health_failure(&name, &health));
            }
            entry.record_health(&health, self.config.health.history_limit);
        }

        if !opts.skip_register {
            if opts.force {
                self.store
                    .add_or_replace(entry, self.config.health.history_limit)?;
            } else {
                self.store.add(entry)?;
            }
            report.registered = true;
            info!(server = %name, "registered");
        }

        let target = compose_target(&container);
        let platforms = self.target_platforms(&opts.platforms);
        let mut written = Vec::new();
        let mut failure = None;
        for id in &platforms {
            match self.platforms.add_server(*id, &name, &target) {
                Ok(change) => {
                    written.push(*id);
                    report.platforms.push(change);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if report.registered && !written.is_empty() {
            self.store.add_platforms(&name, &written)?;
        }
        match failure {
            Some(LibrarianError::PlatformConfig {
                platform, message, ..
            }) if report.registered => {
                let pending: Vec<PlatformId> = platforms
                    .into_iter()
                    .filter(|id| !written.contains(id))
                    .collect();
                Err(LibrarianError::PlatformConfig {
                    platform,
                    message,
                    retry: Some(rerun_command(&source, opts.name.as_deref(), &pending)),
                })
            }
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Runs `wrap` over every candidate under `root` with a bounded pool.
    /// One candidate failing never stops the others.
    pub fn wrap_all(
        &self,
        candidates: &[PathBuf],
        root: &Path,
        workers: usize,
        opts: &WrapOptions,
    ) -> BatchReport
    where
        R: Sync,
    {
        let workers = workers.clamp(1, MAX_WORKERS).min(candidates.len().max(1));
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<BatchItem>>> = Mutex::new(name_collisions(candidates));
        let opts = WrapOptions {
            name: None,
            ..opts.clone()
        };

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(path) = candidates.get(index) else {
                        break;
                    };
                    if slots.lock().unwrap_or_else(PoisonError::into_inner)[index].is_some() {
                        continue;
                    }
                    let item = self.wrap_one(path, &opts);
                    slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(item);
                });
            }
        });

        let items: Vec<BatchItem> = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        let succeeded = items.iter().filter(|item| item.ok).count();
        BatchReport {
            root: root.to_path_buf(),
            workers,
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }

    fn wrap_one(&self, path: &Path, opts: &WrapOptions) -> BatchItem {
        let fallback_name = candidate_name(path);
        match self.wrap(path, opts) {
            Ok(report) => BatchItem {
                path: path.to_path_buf(),
                name: report.name,
                ok: true,
                status: report.health.map(|health| health.status),
                error_code: None,
                error: None,
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "wrap failed");
                BatchItem {
                    path: path.to_path_buf(),
                    name: fallback_name,
                    ok: false,
                    status: None,
                    error_code: Some(err.code()),
                    error: Some(err.summary()),
                }
            }
        }
    }

    /// Checks one server, or every registered server, recording each result.
    pub fn check_health(
        &self,
        name: Option<&str>,
        recover: bool,
    ) -> Result<Vec<(RegistryEntry, HealthReport)>, LibrarianError> {
        let entries = match name {
            Some(name) => vec![self.store.require(name)?],
            None => self.store.list_all()?,
        };
        let checker = HealthChecker::new(self.runner, &self.config.health);
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let report = checker.check_and_recover(&entry.health_target(), recover);
            let updated =
                self.store
                    .update_health(&entry.name, &report, self.config.health.history_limit)?;
            results.push((updated, report));
        }
        Ok(results)
    }

    /// Stops the container, drops platform entries and the registry entry, and
    /// deletes the generated config. The source tree is never touched.
    pub fn remove(
        &self,
        name: &str,
        keep_config: bool,
        keep_platform_entry: bool,
    ) -> Result<RemoveReport, LibrarianError> {
        let entry = self.store.require(name)?;
        let container_stopped = DockerBuilder::new(self.runner, false).stop(&entry.compose_target());

        let mut platforms = Vec::new();
        if !keep_platform_entry {
            for id in &entry.registered_platforms {
                platforms.push(self.platforms.remove_server(*id, &entry.name)?);
            }
        }
        self.store.remove(&entry.name)?;

        let servers_root = self.config_root.join("servers");
        let mut config_removed = false;
        if !keep_config && entry.config_path.exists() {
            if entry.config_path.starts_with(&servers_root) {
                fs::remove_dir_all(&entry.config_path)?;
                config_removed = true;
            } else {
                warn!(path = %entry.config_path.display(), "config dir outside the config root; leaving it");
            }
        }
        info!(server = %entry.name, "removed");
        Ok(RemoveReport {
            name: entry.name,
            container_stopped,
            platforms,
            config_removed,
            source_path: entry.source_path,
        })
    }
}

pub fn health_failure(name: &str, report: &HealthReport) -> LibrarianError {
    let result = &report.result;
    let level = result
        .failed_level
        .and_then(|level| serde_json::to_value(level).ok())
        .and_then(|value| value.as_str().map(ToString::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    let mut message = format!("'{name}' is {} ({level})", result.status.as_str());
    if !result.error_message.is_empty() {
        message.push_str(&format!(": {}", result.error_message));
    }
    if report.recovered == Some(false) {
        message.push_str("; recovery attempt did not help");
    }
    LibrarianError::Health(message)
}

fn candidate_name(path: &Path) -> String {
    path.file_name()
        .map(|name| service_name(&name.to_string_lossy()))
        .unwrap_or_default()
}

/// Pre-filled batch slots: every candidate whose service name was already
/// claimed by an earlier candidate fails up front, so two workers never
/// generate into the same `servers/<name>` directory.
fn name_collisions(candidates: &[PathBuf]) -> Vec<Option<BatchItem>> {
    let mut claimed: HashMap<String, &Path> = HashMap::new();
    candidates
        .iter()
        .map(|path| {
            let name = candidate_name(path);
            match claimed.get(&name) {
                Some(first) => Some(BatchItem {
                    path: path.clone(),
                    name: name.clone(),
                    ok: false,
                    status: None,
                    error_code: Some("duplicate_service_name".to_string()),
                    error: Some(format!(
                        "service name '{name}' is already taken by {} in this batch",
                        first.display()
                    )),
                }),
                None => {
                    claimed.insert(name, path.as_path());
                    None
                }
            }
        })
        .collect()
}

/// The `wrap --force` invocation that finishes a wrap whose platform updates
/// stopped part way.
fn rerun_command(source: &Path, name: Option<&str>, platforms: &[PlatformId]) -> String {
    let mut command = format!(
        "mcp-librarian wrap {}",
        shell_single_quote(&source.display().to_string())
    );
    if let Some(name) = name {
        command.push_str(&format!(" --name {}", shell_single_quote(name)));
    }
    for id in platforms {
        command.push_str(&format!(" --platform {id}"));
    }
    command.push_str(" --force");
    command
}

pub fn batch_error(report: &BatchReport) -> LibrarianError {
    LibrarianError::Batch(format!(
        "{} of {} servers failed to wrap",
        report.failed,
        report.items.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::default_detectors;
    use crate::detect::fixtures::{node_server, python_server};
    use crate::docker::testing::{ok_output, MockDockerRunner};
    use crate::docker::RunOutcome;
    use crate::health::testing::responder;
    use crate::platforms::PlatformPaths;
    use crate::registry::ServerStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Docker double: writes a lockfile for `npm install --package-lock-only`
    /// and otherwise behaves like a healthy MCP server.
    fn fake_docker() -> MockDockerRunner {
        MockDockerRunner::with_responder(|args, stdin| {
            if args.iter().any(|a| a == "--package-lock-only") {
                if let Some(mount) = args.iter().position(|a| a == "-v").and_then(|i| args.get(i + 1)) {
                    let host = mount.trim_end_matches(":/app");
                    fs::write(Path::new(host).join("package-lock.json"), "{}").unwrap();
                }
                return ok_output("");
            }
            if args.iter().any(|a| a == "build" || a == "up" || a == "down") {
                return ok_output("");
            }
            responder(args, stdin, Duration::from_millis(40), &["get_forecast"])
        })
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        home: PathBuf,
        src: PathBuf,
        config: Config,
        store: RegistryStore,
        platforms: PlatformManager,
        detectors: Vec<Box<dyn Detector>>,
        generator: Generator,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("librarian");
        let home = dir.path().join("home");
        let src = dir.path().join("src");
        fs::create_dir_all(&home).unwrap();
        let mut config = Config::default();
        config.health.recovery_wait_sec = 0;
        Fixture {
            store: RegistryStore::new(&root),
            platforms: PlatformManager::new(PlatformPaths::rooted(&home)),
            detectors: default_detectors(),
            generator: Generator::new().unwrap(),
            _dir: dir,
            root,
            home,
            src,
            config,
        }
    }

    impl Fixture {
        fn librarian<'a>(&'a self, runner: &'a MockDockerRunner) -> Librarian<'a, MockDockerRunner> {
            Librarian {
                runner,
                config: &self.config,
                config_root: &self.root,
                store: &self.store,
                platforms: &self.platforms,
                detectors: &self.detectors,
                generator: &self.generator,
            }
        }
    }

    #[test]
    fn node_server_without_lockfile_is_wrapped_end_to_end() {
        let fx = fixture();
        let server_dir = fx.src.join("weather");
        node_server(&server_dir, false);
        let runner = fake_docker();
        let opts = WrapOptions {
            platforms: vec![PlatformId::Cursor],
            ..WrapOptions::default()
        };
        let report = fx.librarian(&runner).wrap(&server_dir, &opts).unwrap();

        assert_eq!(report.name, "weather");
        assert!(server_dir.join("package-lock.json").is_file());
        assert!(report.fixes.iter().all(|fix| fix.success));
        assert_eq!(report.health.as_ref().unwrap().status, HealthStatus::Healthy);
        assert!(report.registered);

        let entry = fx.store.require("weather").unwrap();
        assert_eq!(entry.status, ServerStatus::Active);
        assert_eq!(entry.registered_platforms, vec![PlatformId::Cursor]);
        assert_eq!(entry.health_history.len(), 1);
        assert!(fx.root.join("servers/weather/Dockerfile").is_file());
        assert!(fx.home.join(".cursor/mcp.json").is_file());

        let calls = runner.calls();
        let order: Vec<&str> = calls
            .iter()
            .filter_map(|c| {
                ["--package-lock-only", "build", "up", "ps"]
                    .into_iter()
                    .find(|step| c.args.iter().any(|a| a == step))
            })
            .collect();
        assert_eq!(order, vec!["--package-lock-only", "build", "up", "ps"]);
    }

    #[test]
    fn duplicate_registration_needs_force() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = fake_docker();
        let lib = fx.librarian(&runner);
        lib.wrap(&server_dir, &WrapOptions::default()).unwrap();

        let err = lib.wrap(&server_dir, &WrapOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ALREADY_REGISTERED);

        let forced = WrapOptions {
            force: true,
            ..WrapOptions::default()
        };
        lib.wrap(&server_dir, &forced).unwrap();
        assert_eq!(fx.store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = MockDockerRunner::default();
        let opts = WrapOptions {
            dry_run: true,
            ..WrapOptions::default()
        };
        let report = fx.librarian(&runner).wrap(&server_dir, &opts).unwrap();
        let rendered = report.rendered.unwrap();
        assert!(rendered.dockerfile.contains("FROM"));
        assert!(!fx.root.exists());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn unknown_runtime_is_a_detection_failure() {
        let fx = fixture();
        let empty = fx.src.join("empty");
        fs::create_dir_all(&empty).unwrap();
        let runner = MockDockerRunner::default();
        let err = fx.librarian(&runner).wrap(&empty, &WrapOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_DETECTION);
        assert_eq!(err.code(), "unknown_runtime");
    }

    #[test]
    fn unhealthy_after_recovery_is_not_registered() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = MockDockerRunner::with_responder(|args, stdin| {
            if args.iter().any(|a| a == "run") {
                return RunOutcome::TimedOut {
                    elapsed: Duration::from_secs(10),
                };
            }
            if args.iter().any(|a| a == "ps") {
                return responder(args, stdin, Duration::ZERO, &[]);
            }
            ok_output("")
        });
        let err = fx.librarian(&runner).wrap(&server_dir, &WrapOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_HEALTH);
        assert!(err.to_string().contains("l2_protocol"));
        assert!(err.to_string().contains("recovery attempt did not help"));
        assert!(fx.store.get("notes").unwrap().is_none());
        let restarts = runner.calls().iter().filter(|c| c.args.iter().any(|a| a == "restart")).count();
        assert_eq!(restarts, 1);
    }

    #[test]
    fn batch_isolates_failures() {
        let fx = fixture();
        python_server(&fx.src.join("notes"));
        node_server(&fx.src.join("weather"), true);
        fs::create_dir_all(fx.src.join("scratch")).unwrap();
        let candidates = detect::discover_candidates(&fx.src, None).unwrap();
        let runner = fake_docker();
        let report = fx
            .librarian(&runner)
            .wrap_all(&candidates, &fx.src, 4, &WrapOptions::default());

        assert_eq!(report.items.len(), 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        let failed = report.items.iter().find(|item| !item.ok).unwrap();
        assert_eq!(failed.name, "scratch");
        assert_eq!(failed.error_code.as_deref(), Some("unknown_runtime"));
        assert_eq!(fx.store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn remove_cleans_up_but_leaves_source() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = fake_docker();
        let lib = fx.librarian(&runner);
        let opts = WrapOptions {
            platforms: vec![PlatformId::ClaudeCode],
            ..WrapOptions::default()
        };
        lib.wrap(&server_dir, &opts).unwrap();
        let before = fs::metadata(server_dir.join("main.py")).unwrap().modified().unwrap();

        let report = lib.remove("notes", false, false).unwrap();
        assert!(report.container_stopped);
        assert!(report.config_removed);
        assert_eq!(report.platforms.len(), 1);
        assert!(fx.store.get("notes").unwrap().is_none());
        assert!(!fx.root.join("servers/notes").exists());

        let claude: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(fx.home.join(".claude.json")).unwrap()).unwrap();
        assert!(claude["mcpServers"].get("notes").is_none());
        let after = fs::metadata(server_dir.join("main.py")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn health_marks_missing_source() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = fake_docker();
        let lib = fx.librarian(&runner);
        lib.wrap(&server_dir, &WrapOptions::default()).unwrap();
        fs::remove_dir_all(&server_dir).unwrap();

        let results = lib.check_health(Some("notes"), false).unwrap();
        assert_eq!(results[0].1.result.status, HealthStatus::Unknown);
        assert_eq!(results[0].0.status, ServerStatus::SourceMissing);
    }

    #[test]
    fn platform_failure_after_registration_suggests_forced_rerun() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let cursor = fx.home.join(".cursor/mcp.json");
        fs::create_dir_all(cursor.parent().unwrap()).unwrap();
        fs::write(&cursor, "{\"mcpServers\": {\n").unwrap();
        let runner = fake_docker();
        let lib = fx.librarian(&runner);
        let opts = WrapOptions {
            platforms: vec![PlatformId::Cursor, PlatformId::ClaudeCode],
            ..WrapOptions::default()
        };

        let err = lib.wrap(&server_dir, &opts).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_PLATFORM_CONFIG);
        let LibrarianError::PlatformConfig { retry: Some(retry), .. } = &err else {
            panic!("expected a retry hint, got {err:?}");
        };
        assert!(retry.ends_with("--platform cursor --force"), "{retry}");
        assert!(!retry.contains("claude_code"));
        let entry = fx.store.require("notes").unwrap();
        assert_eq!(entry.registered_platforms, vec![PlatformId::ClaudeCode]);

        fs::write(&cursor, "{}").unwrap();
        let forced = WrapOptions {
            platforms: vec![PlatformId::Cursor],
            force: true,
            ..WrapOptions::default()
        };
        lib.wrap(&server_dir, &forced).unwrap();
        let entry = fx.store.require("notes").unwrap();
        assert_eq!(
            entry.registered_platforms,
            vec![PlatformId::ClaudeCode, PlatformId::Cursor]
        );
        assert_eq!(entry.health.total_checks, 2);
        assert_eq!(entry.health_history.len(), 2);
    }

    #[test]
    fn forced_rewrap_replaces_unhealthy_record() {
        let fx = fixture();
        let server_dir = fx.src.join("notes");
        python_server(&server_dir);
        let runner = fake_docker();
        let lib = fx.librarian(&runner);
        lib.wrap(&server_dir, &WrapOptions::default()).unwrap();

        let stopped = MockDockerRunner::default();
        stopped.push_output(ok_output(r#"[{"Service":"notes","State":"exited"}]"#));
        fx.librarian(&stopped).check_health(Some("notes"), false).unwrap();
        assert_eq!(fx.store.require("notes").unwrap().status, ServerStatus::Stopped);

        let forced = WrapOptions {
            force: true,
            ..WrapOptions::default()
        };
        lib.wrap(&server_dir, &forced).unwrap();
        let entry = fx.store.require("notes").unwrap();
        assert_eq!(entry.status, ServerStatus::Active);
        assert_eq!(entry.health.last_status, HealthStatus::Healthy);
        assert_eq!(entry.health.consecutive_failures, 0);
        assert_eq!(entry.health.total_checks, 3);
        assert_eq!(entry.health_history.last().unwrap().status, HealthStatus::Healthy);
    }

    #[test]
    fn batch_rejects_colliding_service_names() {
        let fx = fixture();
        python_server(&fx.src.join("my notes"));
        python_server(&fx.src.join("my-notes"));
        let candidates = detect::discover_candidates(&fx.src, None).unwrap();
        let runner = fake_docker();
        let report = fx
            .librarian(&runner)
            .wrap_all(&candidates, &fx.src, 2, &WrapOptions::default());

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let first = &report.items[0];
        assert!(first.ok);
        assert_eq!(first.path, fx.src.join("my notes"));
        let second = &report.items[1];
        assert_eq!(second.name, "my-notes");
        assert_eq!(second.error_code.as_deref(), Some("duplicate_service_name"));
        let builds = runner.calls().iter().filter(|c| c.args.iter().any(|a| a == "build")).count();
        assert_eq!(builds, 1);
    }

    #[test]
    fn worker_count_is_bounded() {
        assert!(validate_workers(0).is_err());
        assert_eq!(validate_workers(8).unwrap(), 8);
        assert!(validate_workers(9).is_err());
    }
}
