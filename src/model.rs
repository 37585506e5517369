use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    Python,
    Node,
    Rust,
    Unknown,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Rust => "rust",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Uv,
    Pip,
    Npm,
    Cargo,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uv => "uv",
            Self::Pip => "pip",
            Self::Npm => "npm",
            Self::Cargo => "cargo",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPattern {
    VolumeMounted,
    SelfContained,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Token,
    Password,
    Url,
    Path,
    Plain,
}

impl CredentialType {
    pub fn infer(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.contains("API_KEY") || upper.ends_with("_KEY") || upper == "KEY" {
            Self::ApiKey
        } else if upper.contains("TOKEN") || upper.contains("SECRET") {
            Self::Token
        } else if upper.contains("PASSWORD") || upper.contains("PASSWD") || upper.ends_with("_PASS") {
            Self::Password
        } else if upper.contains("URL") || upper.contains("URI") || upper.contains("ENDPOINT") || upper.ends_with("_HOST") {
            Self::Url
        } else if upper.contains("PATH") || upper.contains("_DIR") || upper.ends_with("_FILE") {
            Self::Path
        } else {
            Self::Plain
        }
    }

    pub fn masked_example(&self) -> &'static str {
        match self {
            Self::ApiKey => "sk-****************",
            Self::Token => "tok_****************",
            Self::Password => "********",
            Self::Url => "https://example.com",
            Self::Path => "/path/to/data",
            Self::Plain => "value",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub required: bool,
    pub credential_type: CredentialType,
    pub masked_example: String,
}

impl EnvVar {
    pub fn new(name: &str, required: bool) -> Self {
        let credential_type = CredentialType::infer(name);
        Self {
            name: name.to_string(),
            required,
            credential_type,
            masked_example: credential_type.masked_example().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataVolume {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Snapshot of one MCP server as classified by a detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServer {
    pub source_path: PathBuf,
    pub name: String,
    pub runtime: Runtime,
    pub runtime_version: String,
    /// Empty when no entry point could be determined.
    pub entry_point: String,
    pub package_manager: PackageManager,
    pub dependencies: Vec<String>,
    pub env_vars: Vec<EnvVar>,
    pub data_volumes: Vec<DataVolume>,
    pub deployment_pattern: DeploymentPattern,
    pub has_lockfile: bool,
    /// Node `scripts.build` present, or a compiled runtime.
    pub has_build_step: bool,
    pub security_warnings: Vec<String>,
}

impl McpServer {
    /// Wrapped servers are named after their source directory.
    pub fn service_name(&self) -> String {
        match self.source_path.file_name() {
            Some(dir) => service_name(&dir.to_string_lossy()),
            None => service_name(&self.name),
        }
    }
}

/// Lowercased, restricted to `[a-z0-9_-]`, usable as compose service, project
/// and registry key.
pub fn service_name(raw: &str) -> String {
    let raw = raw.rsplit('/').next().unwrap_or(raw);
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for ch in raw.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '_' {
            ch.to_ascii_lowercase()
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash || out.is_empty() {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "mcp-server".to_string()
    } else {
        out
    }
}
