use crate::docker::ComposeTarget;
use crate::error::LibrarianError;
use crate::fsutil::{shell_single_quote, write_atomic_text_file, write_atomic_text_file_preserving_mode};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum PlatformId {
    ClaudeCode,
    Cursor,
    Vscode,
    Goose,
    Codex,
    Opencode,
}

impl PlatformId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude_code",
            Self::Cursor => "cursor",
            Self::Vscode => "vscode",
            Self::Goose => "goose",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

/// Where a platform keeps its server entries.
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Object keyed by server name, at this key path.
    Keyed(&'static [&'static str]),
    /// Array of objects carrying a `name` field.
    Listed(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct PlatformSpec {
    format: Format,
    slot: Slot,
}

fn layout(id: PlatformId) -> PlatformSpec {
    match id {
        PlatformId::ClaudeCode | PlatformId::Cursor => PlatformSpec {
            format: Format::Json,
            slot: Slot::Keyed(&["mcpServers"]),
        },
        PlatformId::Vscode => PlatformSpec {
            format: Format::Json,
            slot: Slot::Keyed(&["mcp", "servers"]),
        },
        PlatformId::Opencode => PlatformSpec {
            format: Format::Json,
            slot: Slot::Keyed(&["mcp"]),
        },
        PlatformId::Goose => PlatformSpec {
            format: Format::Yaml,
            slot: Slot::Listed("extensions"),
        },
        PlatformId::Codex => PlatformSpec {
            format: Format::Yaml,
            slot: Slot::Listed("tools"),
        },
    }
}

/// Roots the platform config files are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPaths {
    pub home: PathBuf,
    /// OS config dir (VS Code user settings live below it).
    pub config_dir: PathBuf,
}

impl PlatformPaths {
    pub fn from_env() -> Result<Self, LibrarianError> {
        let home = dirs::home_dir().ok_or_else(|| {
            LibrarianError::Config("could not determine the home directory".to_string())
        })?;
        let config_dir = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        Ok(Self { home, config_dir })
    }

    pub fn rooted(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            config_dir: home.join(".config"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlatformChange {
    pub platform: PlatformId,
    pub path: PathBuf,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Read, validate, back up, merge and atomically write one platform config.
/// Updates are serialized so batch workers never drop each other's entries.
#[derive(Debug)]
pub struct PlatformManager {
    paths: PlatformPaths,
    lock: Mutex<()>,
}

impl PlatformManager {
    pub fn new(paths: PlatformPaths) -> Self {
        Self {
            paths,
            lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self, id: PlatformId) -> PathBuf {
        let home = &self.paths.home;
        match id {
            PlatformId::ClaudeCode => home.join(".claude.json"),
            PlatformId::Cursor => home.join(".cursor").join("mcp.json"),
            PlatformId::Vscode => self
                .paths
                .config_dir
                .join("Code")
                .join("User")
                .join("settings.json"),
            PlatformId::Goose => home.join(".config").join("goose").join("config.yaml"),
            PlatformId::Codex => home.join(".codex").join("config.yaml"),
            PlatformId::Opencode => home.join(".config").join("opencode").join("opencode.json"),
        }
    }

    pub fn codex_wrapper_path(&self, name: &str) -> PathBuf {
        self.paths
            .home
            .join(".codex")
            .join("tools")
            .join(format!("{name}.sh"))
    }

    pub fn add_server(
        &self,
        id: PlatformId,
        name: &str,
        target: &ComposeTarget,
    ) -> Result<PlatformChange, LibrarianError> {
        let mut launch = vec!["docker".to_string()];
        launch.extend(target.stdio_launch_args());
        let script = (id == PlatformId::Codex).then(|| self.codex_wrapper_path(name));
        let entry = entry_value(id, name, &launch, script.as_deref());
        let change = self.apply(id, |doc| insert_entry(doc, layout(id).slot, name, entry))?;
        if let Some(path) = &script {
            let quoted: Vec<String> = launch.iter().map(|arg| shell_single_quote(arg)).collect();
            let body = format!("#!/bin/sh\nexec {} \"$@\"\n", quoted.join(" "));
            write_atomic_text_file(path, &body, Some(0o755))
                .map_err(|err| platform_error(id, format!("failed to write {}: {err}", path.display())))?;
        }
        info!(platform = %id, server = name, "platform entry written");
        Ok(change)
    }

    pub fn remove_server(&self, id: PlatformId, name: &str) -> Result<PlatformChange, LibrarianError> {
        let change = self.apply(id, |doc| remove_entry(doc, layout(id).slot, name))?;
        if id == PlatformId::Codex {
            let script = self.codex_wrapper_path(name);
            if script.exists() {
                fs::remove_file(&script)
                    .map_err(|err| platform_error(id, format!("failed to remove {}: {err}", script.display())))?;
            }
        }
        info!(platform = %id, server = name, changed = change.changed, "platform entry removed");
        Ok(change)
    }

    /// Leaves the file untouched when it cannot be parsed or when `mutate`
    /// reports no change.
    fn apply<F>(&self, id: PlatformId, mutate: F) -> Result<PlatformChange, LibrarianError>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<bool, String>,
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.config_path(id);
        let format = layout(id).format;
        let existing = if path.exists() {
            Some(
                fs::read_to_string(&path)
                    .map_err(|err| platform_error(id, format!("failed to read {}: {err}", path.display())))?,
            )
        } else {
            None
        };
        let mut doc = match existing.as_deref() {
            Some(text) => parse_document(format, text).map_err(|err| {
                platform_error(id, format!("{}: {err}; the file was left unchanged", path.display()))
            })?,
            None => Map::new(),
        };

        let changed = mutate(&mut doc).map_err(|err| {
            platform_error(id, format!("{}: {err}; the file was left unchanged", path.display()))
        })?;
        if !changed {
            debug!(platform = %id, path = %path.display(), "platform config already up to date");
            return Ok(PlatformChange {
                platform: id,
                path,
                changed: false,
                backup: None,
            });
        }

        let backup = if existing.is_some() {
            let backup = backup_path(&path);
            fs::copy(&path, &backup).map_err(|err| {
                platform_error(id, format!("failed to back up {}: {err}", path.display()))
            })?;
            Some(backup)
        } else {
            None
        };
        let body = render_document(format, &doc)?;
        write_atomic_text_file_preserving_mode(&path, &body, 0o600)
            .map_err(|err| platform_error(id, format!("failed to write {}: {err}", path.display())))?;
        Ok(PlatformChange {
            platform: id,
            path,
            changed: true,
            backup,
        })
    }
}

fn platform_error(id: PlatformId, message: String) -> LibrarianError {
    LibrarianError::PlatformConfig {
        platform: id.to_string(),
        message,
        retry: None,
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".bak");
    PathBuf::from(raw)
}

fn parse_document(format: Format, text: &str) -> Result<Map<String, Value>, String> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    let value = match format {
        Format::Json => serde_json::from_str::<Value>(text).map_err(|err| {
            format!(
                "invalid JSON at line {} column {}: {err}",
                err.line(),
                err.column()
            )
        })?,
        Format::Yaml => serde_yaml::from_str::<Value>(text).map_err(|err| match err.location() {
            Some(loc) => format!(
                "invalid YAML at line {} column {}: {err}",
                loc.line(),
                loc.column()
            ),
            None => format!("invalid YAML: {err}"),
        })?,
    };
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err("top level is not a mapping".to_string()),
    }
}

fn render_document(format: Format, doc: &Map<String, Value>) -> Result<String, LibrarianError> {
    Ok(match format {
        Format::Json => format!("{}\n", serde_json::to_string_pretty(doc)?),
        Format::Yaml => serde_yaml::to_string(doc)?,
    })
}

fn entry_value(id: PlatformId, name: &str, launch: &[String], script: Option<&Path>) -> Value {
    let (command, args) = launch.split_first().map_or(("docker", &[][..]), |(c, a)| (c.as_str(), a));
    let description = format!("MCP server: {name}");
    match id {
        PlatformId::ClaudeCode | PlatformId::Vscode => {
            json!({"type": "stdio", "command": command, "args": args})
        }
        PlatformId::Cursor => json!({"command": command, "args": args}),
        PlatformId::Opencode => json!({"type": "local", "command": launch, "enabled": true}),
        PlatformId::Goose => json!({
            "name": name,
            "type": "stdio",
            "cmd": command,
            "args": args,
            "description": description,
            "enabled": true,
        }),
        PlatformId::Codex => json!({
            "name": name,
            "type": "shell",
            "script": script.map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
            "description": description,
        }),
    }
}

fn child_object<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, String> {
    map.entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| format!("`{key}` is not an object"))
}

fn insert_entry(doc: &mut Map<String, Value>, slot: Slot, name: &str, entry: Value) -> Result<bool, String> {
    match slot {
        Slot::Keyed(path) => {
            let mut current = doc;
            for key in path {
                current = child_object(current, key)?;
            }
            if current.get(name) == Some(&entry) {
                return Ok(false);
            }
            current.insert(name.to_string(), entry);
            Ok(true)
        }
        Slot::Listed(key) => {
            let items = doc
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if items.is_null() {
                *items = Value::Array(Vec::new());
            }
            let items = items
                .as_array_mut()
                .ok_or_else(|| format!("`{key}` is not a list"))?;
            match items
                .iter_mut()
                .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
            {
                Some(existing) if *existing == entry => Ok(false),
                Some(existing) => {
                    *existing = entry;
                    Ok(true)
                }
                None => {
                    items.push(entry);
                    Ok(true)
                }
            }
        }
    }
}

fn remove_entry(doc: &mut Map<String, Value>, slot: Slot, name: &str) -> Result<bool, String> {
    match slot {
        Slot::Keyed(path) => {
            let mut current = doc;
            for key in path {
                match current.get_mut(*key).and_then(Value::as_object_mut) {
                    Some(next) => current = next,
                    None => return Ok(false),
                }
            }
            Ok(current.shift_remove(name).is_some())
        }
        Slot::Listed(key) => {
            let Some(items) = doc.get_mut(key).and_then(Value::as_array_mut) else {
                return Ok(false);
            };
            let before = items.len();
            items.retain(|item| item.get("name").and_then(Value::as_str) != Some(name));
            Ok(items.len() != before)
        }
    }
}
