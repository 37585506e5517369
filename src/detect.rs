use crate::error::LibrarianError;
use crate::model::{DataVolume, DeploymentPattern, EnvVar, McpServer, PackageManager, Runtime};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

pub const ISSUE_UNKNOWN_RUNTIME: &str = "unknown_runtime";
pub const ISSUE_INVALID_MANIFEST: &str = "invalid_json_manifest";
pub const ISSUE_PATH_NOT_FOUND: &str = "path_not_found";

const DEFAULT_PYTHON_VERSION: &str = "3.11";
const DEFAULT_NODE_VERSION: &str = "20";
const DEFAULT_RUST_VERSION: &str = "1.85";

const NODE_MCP_PACKAGES: &[&str] = &["@modelcontextprotocol/sdk", "@modelcontextprotocol/server"];
const RUST_MCP_CRATES: &[&str] = &["rmcp", "rust-mcp-sdk", "mcp-server", "mcp-sdk"];

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".venv",
    "__pycache__",
    ".git",
    "dist",
    "build",
    "target",
];

const SYSTEM_PREFIXES: &[&str] = &[
    "/usr", "/etc", "/var", "/sys", "/proc", "/dev", "/tmp", "/opt", "/root", "/lib", "/lib64",
    "/bin", "/sbin", "/run", "/boot", "/home",
];

const USER_DATA_MARKERS: &[&str] = &["/mnt/", "/media/", "/data/", "/srv/", "Drive", "Storage"];

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)*").expect("valid version regex"));
static MAJOR_MINOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("valid version regex"));

static PY_GETENV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"os\.(?:getenv|environ\.get)\(\s*["']([A-Za-z_][A-Za-z0-9_]*)["']\s*(,)?"#)
        .expect("valid env regex")
});
static PY_ENVIRON_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"os\.environ\[\s*["']([A-Za-z_][A-Za-z0-9_]*)["']\s*\]"#)
        .expect("valid env regex")
});
static NODE_ENV_DOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"process\.env\.([A-Za-z_][A-Za-z0-9_]*)(\s*(?:\|\||\?\?))?")
        .expect("valid env regex")
});
static NODE_ENV_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"process\.env\[\s*["']([A-Za-z_][A-Za-z0-9_]*)["']\s*\](\s*(?:\|\||\?\?))?"#)
        .expect("valid env regex")
});
static RUST_ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"env::var(?:_os)?\(\s*"([A-Za-z_][A-Za-z0-9_]*)"\s*\)(\s*\.unwrap_or)?"#)
        .expect("valid env regex")
});
static PATH_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'](/[^"'\n]+)["']"#).expect("valid path regex"));
static HARDCODED_CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(password|secret|api_key|token)\s*[=:]\s*["'][^"']+["']"#)
        .expect("valid credential regex")
});

/// Classifies one runtime family. Detectors are tried in order and the first
/// whose `can_detect` returns true owns the directory.
pub trait Detector: Send + Sync {
    fn runtime(&self) -> Runtime;
    fn can_detect(&self, path: &Path) -> bool;
    fn detect(&self, path: &Path) -> Result<McpServer, LibrarianError>;
}

pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(PythonDetector),
        Box::new(NodeDetector),
        Box::new(RustDetector),
    ]
}

pub fn detect_server(
    path: &Path,
    detectors: &[Box<dyn Detector>],
) -> Result<McpServer, LibrarianError> {
    if !path.is_dir() {
        return Err(LibrarianError::Detection {
            path: path.to_path_buf(),
            issue: ISSUE_PATH_NOT_FOUND.to_string(),
            message: "directory does not exist".to_string(),
        });
    }
    for detector in detectors {
        if detector.can_detect(path) {
            debug!(path = %path.display(), runtime = %detector.runtime(), "detector matched");
            return detector.detect(path);
        }
    }
    Err(LibrarianError::Detection {
        path: path.to_path_buf(),
        issue: ISSUE_UNKNOWN_RUNTIME.to_string(),
        message: "no supported MCP server manifest found".to_string(),
    })
}

/// Immediate, non-hidden child directories of `root`, sorted by name.
pub fn discover_candidates(root: &Path, filter: Option<&str>) -> Result<Vec<PathBuf>, LibrarianError> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        if let Some(filter) = filter {
            if !name.contains(filter) {
                continue;
            }
        }
        candidates.push(entry.path());
    }
    candidates.sort();
    Ok(candidates)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "mcp-server".to_string())
}

fn invalid_manifest(path: &Path, manifest: &str, err: impl std::fmt::Display) -> LibrarianError {
    LibrarianError::Detection {
        path: path.to_path_buf(),
        issue: ISSUE_INVALID_MANIFEST.to_string(),
        message: format!("{manifest} is not valid: {err}"),
    }
}

fn read_version_file(path: &Path, names: &[&str]) -> Option<String> {
    for name in names {
        if let Ok(content) = fs::read_to_string(path.join(name)) {
            if let Some(version) = extract_version(&content) {
                return Some(version);
            }
        }
    }
    None
}

/// First dotted number in a constraint such as `>=18.12 <21` or `v20.11.1`.
pub fn extract_version(raw: &str) -> Option<String> {
    VERSION_RE.find(raw).map(|m| m.as_str().to_string())
}

pub fn version_major(raw: &str) -> Option<&str> {
    raw.split('.').next().filter(|part| !part.is_empty())
}

/// Keys from a dotenv file; blank lines, comments and lines without `=` are
/// skipped.
pub fn parse_env_file(path: &Path) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return values;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        values.insert(key.to_string(), value.to_string());
    }
    values
}

#[derive(Default)]
struct EnvScan {
    order: Vec<String>,
    required: BTreeMap<String, bool>,
}

impl EnvScan {
    fn record(&mut self, name: &str, has_default: bool) {
        match self.required.get_mut(name) {
            // Any defaulted read makes the variable optional.
            Some(required) => *required = *required && !has_default,
            None => {
                self.order.push(name.to_string());
                self.required.insert(name.to_string(), !has_default);
            }
        }
    }

    fn scan(&mut self, source: &str, patterns: &[&Regex]) {
        for pattern in patterns {
            for caps in pattern.captures_iter(source) {
                if let Some(name) = caps.get(1) {
                    self.record(name.as_str(), caps.get(2).is_some());
                }
            }
        }
    }

    fn into_env_vars(self, dotenv: &BTreeMap<String, String>) -> Vec<EnvVar> {
        let mut vars: Vec<EnvVar> = self
            .order
            .iter()
            .map(|name| EnvVar::new(name, self.required.get(name).copied().unwrap_or(false)))
            .collect();
        for key in dotenv.keys() {
            if !self.required.contains_key(key) {
                vars.push(EnvVar::new(key, false));
            }
        }
        vars
    }
}

fn env_patterns(runtime: Runtime) -> Vec<&'static Regex> {
    match runtime {
        Runtime::Python => vec![&*PY_GETENV_RE, &*PY_ENVIRON_INDEX_RE],
        Runtime::Node => vec![&*NODE_ENV_DOT_RE, &*NODE_ENV_INDEX_RE],
        Runtime::Rust => vec![&*RUST_ENV_RE],
        Runtime::Unknown => Vec::new(),
    }
}

/// Selects data-volume candidates from path literals and dotenv values.
pub fn infer_data_volumes<F>(literals: &[String], env_values: &[String], is_dir: F) -> Vec<DataVolume>
where
    F: Fn(&Path) -> bool,
{
    let is_system = |candidate: &str| {
        SYSTEM_PREFIXES
            .iter()
            .any(|prefix| candidate == *prefix || candidate.starts_with(&format!("{prefix}/")))
    };
    let mut seen = BTreeMap::new();
    let literal_hits = literals.iter().filter(|literal| {
        USER_DATA_MARKERS.iter().any(|marker| literal.contains(marker))
    });
    for candidate in literal_hits.chain(env_values.iter()) {
        let candidate = candidate.trim_end_matches('/');
        if !candidate.starts_with('/') || is_system(candidate) || seen.contains_key(candidate) {
            continue;
        }
        let host_path = PathBuf::from(candidate);
        if !is_dir(&host_path) {
            continue;
        }
        let base = host_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string());
        seen.insert(
            candidate.to_string(),
            DataVolume {
                host_path,
                container_path: format!("/data/{base}"),
                read_only: false,
            },
        );
    }
    let mut volumes: Vec<DataVolume> = seen.into_values().collect();
    volumes.sort_by(|a, b| a.host_path.cmp(&b.host_path));
    let mut used = BTreeMap::new();
    for volume in &mut volumes {
        let count = used.entry(volume.container_path.clone()).or_insert(0usize);
        *count += 1;
        if *count > 1 {
            volume.container_path = format!("{}-{}", volume.container_path, count);
        }
    }
    volumes
}

/// Entry-point derived facts shared by every detector.
struct SourceFacts {
    env_vars: Vec<EnvVar>,
    data_volumes: Vec<DataVolume>,
    security_warnings: Vec<String>,
}

fn analyze_sources(root: &Path, runtime: Runtime, files: &[PathBuf]) -> SourceFacts {
    let dotenv = parse_env_file(&root.join(".env"));
    let patterns = env_patterns(runtime);
    let mut env = EnvScan::default();
    let mut literals = Vec::new();
    let mut security_warnings = Vec::new();
    for file in files {
        let Ok(source) = fs::read_to_string(file) else {
            continue;
        };
        env.scan(&source, &patterns);
        literals.extend(
            PATH_LITERAL_RE
                .captures_iter(&source)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string())),
        );
        if HARDCODED_CREDENTIAL_RE.is_match(&source) {
            let shown = file.strip_prefix(root).unwrap_or(file);
            security_warnings.push(format!(
                "Potential hardcoded credential in {}. Use environment variables instead.",
                shown.display()
            ));
        }
    }
    let env_values: Vec<String> = dotenv.values().cloned().collect();
    let data_volumes = infer_data_volumes(&literals, &env_values, Path::is_dir);
    SourceFacts {
        env_vars: env.into_env_vars(&dotenv),
        data_volumes,
        security_warnings,
    }
}

fn existing_files(root: &Path, rel: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for rel in rel {
        let candidate = root.join(rel);
        if candidate.is_file() && !files.contains(&candidate) {
            files.push(candidate);
        }
    }
    files
}

fn deployment_for(volumes: &[DataVolume]) -> DeploymentPattern {
    if volumes.is_empty() {
        DeploymentPattern::SelfContained
    } else {
        DeploymentPattern::VolumeMounted
    }
}

pub struct PythonDetector;

impl PythonDetector {
    fn find_in_src(root: &Path) -> Option<String> {
        fn walk(dir: &Path, wanted: &str, found: &mut Vec<PathBuf>) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            let mut entries: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            entries.sort();
            for entry in entries {
                let name = entry.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                if entry.is_dir() {
                    if !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_str()) {
                        walk(&entry, wanted, found);
                    }
                } else if name == wanted {
                    found.push(entry);
                }
            }
        }
        let src = root.join("src");
        for wanted in ["server.py", "__main__.py"] {
            let mut found = Vec::new();
            walk(&src, wanted, &mut found);
            if let Some(first) = found.first() {
                let rel = first.strip_prefix(root).unwrap_or(first);
                return Some(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        None
    }

    /// `pkg.module:main` to the candidate source files of that module.
    fn script_module_files(target: &str) -> Vec<String> {
        let module = target.split(':').next().unwrap_or_default().trim().replace('.', "/");
        if module.is_empty() {
            return Vec::new();
        }
        vec![
            format!("{module}.py"),
            format!("{module}/__init__.py"),
            format!("{module}/__main__.py"),
            format!("src/{module}.py"),
            format!("src/{module}/__init__.py"),
            format!("src/{module}/__main__.py"),
        ]
    }

    fn requirements(root: &Path) -> Vec<String> {
        let Ok(content) = fs::read_to_string(root.join("requirements.txt")) else {
            return Vec::new();
        };
        content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty() && !line.starts_with('-'))
            .map(ToString::to_string)
            .collect()
    }
}

impl Detector for PythonDetector {
    fn runtime(&self) -> Runtime {
        Runtime::Python
    }

    fn can_detect(&self, path: &Path) -> bool {
        path.join("pyproject.toml").is_file() || path.join("requirements.txt").is_file()
    }

    fn detect(&self, path: &Path) -> Result<McpServer, LibrarianError> {
        let manifest = path.join("pyproject.toml");
        let pyproject: toml::Table = if manifest.is_file() {
            let content = fs::read_to_string(&manifest)?;
            toml::from_str(&content).map_err(|err| invalid_manifest(path, "pyproject.toml", err))?
        } else {
            toml::Table::new()
        };
        let project = pyproject.get("project").and_then(toml::Value::as_table);

        let name = project
            .and_then(|p| p.get("name"))
            .and_then(toml::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| dir_name(path));

        let mut dependencies: Vec<String> = project
            .and_then(|p| p.get("dependencies"))
            .and_then(toml::Value::as_array)
            .map(|deps| deps.iter().filter_map(|d| d.as_str().map(ToString::to_string)).collect())
            .unwrap_or_default();
        if dependencies.is_empty() {
            dependencies = Self::requirements(path);
        }

        let runtime_version = project
            .and_then(|p| p.get("requires-python"))
            .and_then(toml::Value::as_str)
            .and_then(|raw| MAJOR_MINOR_RE.find(raw).map(|m| m.as_str().to_string()))
            .or_else(|| {
                fs::read_to_string(path.join(".python-version"))
                    .ok()
                    .and_then(|raw| MAJOR_MINOR_RE.find(&raw).map(|m| m.as_str().to_string()))
            })
            .unwrap_or_else(|| DEFAULT_PYTHON_VERSION.to_string());

        let scripts = project
            .and_then(|p| p.get("scripts"))
            .and_then(toml::Value::as_table)
            .filter(|scripts| !scripts.is_empty());

        let mut scan_files = vec![
            "main.py".to_string(),
            "server.py".to_string(),
            "src/server.py".to_string(),
        ];
        let (entry_point, package_manager) = if let Some((script, target)) = scripts.and_then(|s| s.iter().next()) {
            let mut module_files = Self::script_module_files(target.as_str().unwrap_or_default());
            module_files.append(&mut scan_files);
            scan_files = module_files;
            (script.clone(), PackageManager::Uv)
        } else if path.join("main.py").is_file() {
            ("main.py".to_string(), PackageManager::Pip)
        } else if path.join("server.py").is_file() {
            ("server.py".to_string(), PackageManager::Pip)
        } else if let Some(found) = Self::find_in_src(path) {
            scan_files.insert(0, found.clone());
            (found, PackageManager::Pip)
        } else {
            (String::new(), PackageManager::Pip)
        };

        let facts = analyze_sources(path, Runtime::Python, &existing_files(path, &scan_files));
        Ok(McpServer {
            source_path: path.to_path_buf(),
            name,
            runtime: Runtime::Python,
            runtime_version,
            entry_point,
            package_manager,
            dependencies,
            deployment_pattern: deployment_for(&facts.data_volumes),
            env_vars: facts.env_vars,
            data_volumes: facts.data_volumes,
            has_lockfile: path.join("uv.lock").is_file() || path.join("requirements.txt").is_file(),
            has_build_step: false,
            security_warnings: facts.security_warnings,
        })
    }
}

pub struct NodeDetector;

impl NodeDetector {
    fn read_manifest(path: &Path) -> Option<Result<serde_json::Value, serde_json::Error>> {
        let content = fs::read_to_string(path.join("package.json")).ok()?;
        Some(serde_json::from_str(&content))
    }

    fn has_mcp_sdk(pkg: &serde_json::Value) -> bool {
        ["dependencies", "devDependencies"].iter().any(|section| {
            pkg.get(section)
                .and_then(serde_json::Value::as_object)
                .is_some_and(|deps| NODE_MCP_PACKAGES.iter().any(|name| deps.contains_key(*name)))
        })
    }
}

impl Detector for NodeDetector {
    fn runtime(&self) -> Runtime {
        Runtime::Node
    }

    fn can_detect(&self, path: &Path) -> bool {
        match Self::read_manifest(path) {
            Some(Ok(pkg)) => Self::has_mcp_sdk(&pkg),
            // A broken package.json is still ours to report.
            Some(Err(_)) => true,
            None => false,
        }
    }

    fn detect(&self, path: &Path) -> Result<McpServer, LibrarianError> {
        let pkg = match Self::read_manifest(path) {
            Some(Ok(pkg)) => pkg,
            Some(Err(err)) => return Err(invalid_manifest(path, "package.json", err)),
            None => {
                return Err(LibrarianError::Detection {
                    path: path.to_path_buf(),
                    issue: ISSUE_UNKNOWN_RUNTIME.to_string(),
                    message: "package.json is missing".to_string(),
                })
            }
        };

        let name = pkg
            .get("name")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| dir_name(path));

        let runtime_version = pkg
            .get("engines")
            .and_then(|engines| engines.get("node"))
            .and_then(serde_json::Value::as_str)
            .and_then(extract_version)
            .or_else(|| read_version_file(path, &[".nvmrc", ".node-version"]))
            .unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string());

        let entry_point = pkg
            .get("main")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .or_else(|| match pkg.get("bin") {
                Some(serde_json::Value::String(bin)) => Some(bin.clone()),
                Some(serde_json::Value::Object(map)) => {
                    map.values().find_map(|v| v.as_str().map(ToString::to_string))
                }
                _ => None,
            })
            .unwrap_or_else(|| "index.js".to_string());
        let entry_point = entry_point.trim_start_matches("./").to_string();

        let dependencies: Vec<String> = pkg
            .get("dependencies")
            .and_then(serde_json::Value::as_object)
            .map(|deps| deps.keys().cloned().collect())
            .unwrap_or_default();

        let has_build_step = pkg
            .get("scripts")
            .and_then(|scripts| scripts.get("build"))
            .and_then(serde_json::Value::as_str)
            .is_some();

        let facts = analyze_sources(path, Runtime::Node, &existing_files(path, &[entry_point.clone()]));
        Ok(McpServer {
            source_path: path.to_path_buf(),
            name,
            runtime: Runtime::Node,
            runtime_version,
            entry_point,
            package_manager: PackageManager::Npm,
            dependencies,
            deployment_pattern: deployment_for(&facts.data_volumes),
            env_vars: facts.env_vars,
            data_volumes: facts.data_volumes,
            has_lockfile: path.join("package-lock.json").is_file(),
            has_build_step,
            security_warnings: facts.security_warnings,
        })
    }
}

pub struct RustDetector;

impl RustDetector {
    fn read_manifest(path: &Path) -> Option<toml::Table> {
        let content = fs::read_to_string(path.join("Cargo.toml")).ok()?;
        toml::from_str(&content).ok()
    }

    fn has_mcp_sdk(manifest: &toml::Table) -> bool {
        manifest
            .get("dependencies")
            .and_then(toml::Value::as_table)
            .is_some_and(|deps| RUST_MCP_CRATES.iter().any(|name| deps.contains_key(*name)))
    }
}

impl Detector for RustDetector {
    fn runtime(&self) -> Runtime {
        Runtime::Rust
    }

    fn can_detect(&self, path: &Path) -> bool {
        Self::read_manifest(path).is_some_and(|manifest| Self::has_mcp_sdk(&manifest))
    }

    fn detect(&self, path: &Path) -> Result<McpServer, LibrarianError> {
        let content = fs::read_to_string(path.join("Cargo.toml"))?;
        let manifest: toml::Table =
            toml::from_str(&content).map_err(|err| invalid_manifest(path, "Cargo.toml", err))?;
        let package = manifest.get("package").and_then(toml::Value::as_table);
        let name = package
            .and_then(|p| p.get("name"))
            .and_then(toml::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| dir_name(path));
        let runtime_version = package
            .and_then(|p| p.get("rust-version"))
            .and_then(toml::Value::as_str)
            .and_then(|raw| MAJOR_MINOR_RE.find(raw).map(|m| m.as_str().to_string()))
            .unwrap_or_else(|| DEFAULT_RUST_VERSION.to_string());

        let first_bin = manifest
            .get("bin")
            .and_then(toml::Value::as_array)
            .and_then(|bins| bins.first())
            .and_then(toml::Value::as_table);
        let entry_point = first_bin
            .and_then(|bin| bin.get("name"))
            .and_then(toml::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| name.clone());
        let mut scan_files = vec!["src/main.rs".to_string(), format!("src/bin/{entry_point}.rs")];
        if let Some(bin_path) = first_bin.and_then(|bin| bin.get("path")).and_then(toml::Value::as_str) {
            scan_files.insert(0, bin_path.to_string());
        }

        let dependencies: Vec<String> = manifest
            .get("dependencies")
            .and_then(toml::Value::as_table)
            .map(|deps| deps.keys().cloned().collect())
            .unwrap_or_default();

        let facts = analyze_sources(path, Runtime::Rust, &existing_files(path, &scan_files));
        Ok(McpServer {
            source_path: path.to_path_buf(),
            name,
            runtime: Runtime::Rust,
            runtime_version,
            entry_point,
            package_manager: PackageManager::Cargo,
            dependencies,
            deployment_pattern: deployment_for(&facts.data_volumes),
            env_vars: facts.env_vars,
            data_volumes: facts.data_volumes,
            has_lockfile: path.join("Cargo.lock").is_file(),
            has_build_step: true,
            security_warnings: facts.security_warnings,
        })
    }
}
