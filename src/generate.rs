use crate::docker::project_name;
use crate::error::LibrarianError;
use crate::fsutil::{shell_single_quote, write_if_changed};
use crate::model::{DeploymentPattern, EnvVar, McpServer, PackageManager, Runtime};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PYTHON_UV_TEMPLATE: &str = include_str!("../templates/python-uv.Dockerfile.hbs");
const PYTHON_DIRECT_TEMPLATE: &str = include_str!("../templates/python-direct.Dockerfile.hbs");
const NODE_SELF_CONTAINED_TEMPLATE: &str =
    include_str!("../templates/node-self-contained.Dockerfile.hbs");
const NODE_VOLUME_TEMPLATE: &str = include_str!("../templates/node-volume.Dockerfile.hbs");
const RUST_TEMPLATE: &str = include_str!("../templates/rust.Dockerfile.hbs");
const ENV_EXAMPLE_TEMPLATE: &str = include_str!("../templates/env-example.hbs");

const ENV_STUB: &str = "# Fill in your values (copy from .env.example)\n";
const COMPOSE_HEADER: &str =
    "# Generated by mcp-librarian. Changes are overwritten by `mcp-librarian wrap --force`.\n";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateVariant {
    PythonUv,
    PythonDirect,
    NodeVolume,
    NodeSelfContained,
    Rust,
}

impl TemplateVariant {
    pub fn for_server(server: &McpServer) -> Result<Self, LibrarianError> {
        match (server.runtime, server.package_manager) {
            (Runtime::Python, PackageManager::Uv) => Ok(Self::PythonUv),
            (Runtime::Python, _) => Ok(Self::PythonDirect),
            (Runtime::Node, _) => Ok(match server.deployment_pattern {
                DeploymentPattern::VolumeMounted => Self::NodeVolume,
                DeploymentPattern::SelfContained => Self::NodeSelfContained,
            }),
            (Runtime::Rust, _) => Ok(Self::Rust),
            (Runtime::Unknown, _) => Err(LibrarianError::Detection {
                path: server.source_path.clone(),
                issue: crate::detect::ISSUE_UNKNOWN_RUNTIME.to_string(),
                message: "cannot generate a container for an unknown runtime".to_string(),
            }),
        }
    }

    fn template_name(&self) -> &'static str {
        match self {
            Self::PythonUv => "python-uv",
            Self::PythonDirect => "python-direct",
            Self::NodeVolume => "node-volume",
            Self::NodeSelfContained => "node-self-contained",
            Self::Rust => "rust",
        }
    }
}

/// Paths of the generated files for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    pub config_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub compose_file: PathBuf,
    pub env_example: PathBuf,
    pub env_file: PathBuf,
    pub variant: TemplateVariant,
    pub service: String,
    pub image: String,
}

impl ContainerConfig {
    pub fn for_service(config_root: &Path, service: &str, variant: TemplateVariant) -> Self {
        let config_dir = server_config_dir(config_root, service);
        Self {
            dockerfile: config_dir.join("Dockerfile"),
            compose_file: config_dir.join("docker-compose.yml"),
            env_example: config_dir.join(".env.example"),
            env_file: config_dir.join(".env"),
            config_dir,
            variant,
            service: service.to_string(),
            image: image_tag(service),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedConfig {
    pub config: ContainerConfig,
    pub dockerfile: String,
    pub compose: String,
    pub env_example: String,
}

pub fn server_config_dir(config_root: &Path, service: &str) -> PathBuf {
    config_root.join("servers").join(service)
}

pub fn image_tag(service: &str) -> String {
    format!("{}:latest", project_name(service))
}

#[derive(Debug, Serialize)]
struct DockerfileContext<'a> {
    name: &'a str,
    runtime_version: &'a str,
    entry_point: &'a str,
    entrypoint_json: String,
    install_command: Option<String>,
    copy_requirements: bool,
    build_command: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnvExampleContext<'a> {
    name: &'a str,
    runtime: &'a str,
    env_vars: &'a [EnvVar],
}

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    build: ComposeBuild,
    image: String,
    stdin_open: bool,
    env_file: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<ComposeVolume>,
}

#[derive(Debug, Serialize)]
struct ComposeBuild {
    context: String,
    dockerfile: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ComposeVolume {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: String,
        source: String,
        target: String,
        read_only: bool,
    },
}

impl ComposeVolume {
    /// Long syntax whenever the host path would break `src:dst` parsing.
    fn bind(source: &Path, target: &str, read_only: bool) -> Self {
        let source = source.display().to_string();
        if source.chars().any(|c| c.is_whitespace() || c == ':') {
            Self::Long {
                kind: "bind".to_string(),
                source,
                target: target.to_string(),
                read_only,
            }
        } else if read_only {
            Self::Short(format!("{source}:{target}:ro"))
        } else {
            Self::Short(format!("{source}:{target}"))
        }
    }
}

/// Renders container files. Output depends only on the server snapshot and
/// the config root, so regenerating is byte-identical.
pub struct Generator {
    registry: Handlebars<'static>,
}

impl Generator {
    pub fn new() -> Result<Self, LibrarianError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string("python-uv", PYTHON_UV_TEMPLATE)?;
        registry.register_template_string("python-direct", PYTHON_DIRECT_TEMPLATE)?;
        registry.register_template_string("node-self-contained", NODE_SELF_CONTAINED_TEMPLATE)?;
        registry.register_template_string("node-volume", NODE_VOLUME_TEMPLATE)?;
        registry.register_template_string("rust", RUST_TEMPLATE)?;
        registry.register_template_string("env-example", ENV_EXAMPLE_TEMPLATE)?;
        Ok(Self { registry })
    }

    pub fn render(
        &self,
        server: &McpServer,
        service: &str,
        config_root: &Path,
    ) -> Result<RenderedConfig, LibrarianError> {
        let variant = TemplateVariant::for_server(server)?;
        let config = ContainerConfig::for_service(config_root, service, variant);
        let ctx = dockerfile_context(server, variant);
        let dockerfile = self.registry.render(variant.template_name(), &ctx)?;
        let env_example = self.registry.render(
            "env-example",
            &EnvExampleContext {
                name: service,
                runtime: server.runtime.as_str(),
                env_vars: &server.env_vars,
            },
        )?;
        let compose = render_compose(server, &config)?;
        debug!(service, variant = variant.template_name(), "rendered container config");
        Ok(RenderedConfig {
            config,
            dockerfile,
            compose,
            env_example,
        })
    }

    /// Writes Dockerfile, compose file and `.env.example`, plus a `.env` seeded
    /// from the source tree when none exists yet.
    pub fn generate(
        &self,
        server: &McpServer,
        service: &str,
        config_root: &Path,
    ) -> Result<ContainerConfig, LibrarianError> {
        let rendered = self.render(server, service, config_root)?;
        let config = rendered.config;
        fs::create_dir_all(&config.config_dir)?;
        write_if_changed(&config.dockerfile, &rendered.dockerfile)?;
        write_if_changed(&config.compose_file, &rendered.compose)?;
        write_if_changed(&config.env_example, &rendered.env_example)?;
        if !config.env_file.exists() {
            let seed = fs::read_to_string(server.source_path.join(".env"))
                .unwrap_or_else(|_| ENV_STUB.to_string());
            crate::fsutil::write_atomic_text_file(&config.env_file, &seed, Some(0o600))?;
        }
        info!(service, dir = %config.config_dir.display(), "generated container config");
        Ok(config)
    }
}

fn json_array(parts: &[&str]) -> String {
    serde_json::to_string(parts).unwrap_or_else(|_| "[]".to_string())
}

fn dockerfile_context(server: &McpServer, variant: TemplateVariant) -> DockerfileContext<'_> {
    let entry = server.entry_point.as_str();
    let mut ctx = DockerfileContext {
        name: &server.name,
        runtime_version: &server.runtime_version,
        entry_point: entry,
        entrypoint_json: String::new(),
        install_command: None,
        copy_requirements: false,
        build_command: None,
    };
    match variant {
        TemplateVariant::PythonUv => {
            ctx.entrypoint_json = json_array(&["uv", "run", "--no-sync", entry]);
        }
        TemplateVariant::PythonDirect => {
            ctx.entrypoint_json = json_array(&["python", entry]);
            if server.source_path.join("requirements.txt").is_file() {
                ctx.copy_requirements = true;
                ctx.install_command =
                    Some("pip install --no-cache-dir -r requirements.txt".to_string());
            } else if !server.dependencies.is_empty() {
                let deps: Vec<String> = server
                    .dependencies
                    .iter()
                    .map(|dep| shell_single_quote(dep))
                    .collect();
                ctx.install_command = Some(format!("pip install --no-cache-dir {}", deps.join(" ")));
            }
        }
        TemplateVariant::NodeSelfContained | TemplateVariant::NodeVolume => {
            ctx.entrypoint_json = json_array(&["node", entry]);
            if server.has_build_step {
                ctx.build_command = Some("npm run build".to_string());
            }
        }
        TemplateVariant::Rust => {
            let locked = if server.has_lockfile { " --locked" } else { "" };
            ctx.build_command = Some(format!("cargo build --release{locked} --bin {entry}"));
            let binary = format!("/usr/local/bin/{entry}");
            ctx.entrypoint_json = json_array(&[binary.as_str()]);
        }
    }
    ctx
}

fn render_compose(server: &McpServer, config: &ContainerConfig) -> Result<String, LibrarianError> {
    let mut volumes = Vec::new();
    if config.variant == TemplateVariant::NodeVolume {
        volumes.push(ComposeVolume::bind(&server.source_path, "/app", true));
    }
    for volume in &server.data_volumes {
        volumes.push(ComposeVolume::bind(
            &volume.host_path,
            &volume.container_path,
            volume.read_only,
        ));
    }
    let mut services = BTreeMap::new();
    services.insert(
        config.service.clone(),
        ComposeService {
            build: ComposeBuild {
                context: server.source_path.display().to_string(),
                dockerfile: config.dockerfile.display().to_string(),
            },
            image: config.image.clone(),
            stdin_open: true,
            env_file: vec![".env".to_string()],
            volumes,
        },
    );
    let body = serde_yaml::to_string(&ComposeFile { services })?;
    Ok(format!("{COMPOSE_HEADER}{body}"))
}
