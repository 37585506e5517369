use crate::docker::{project_name, ComposeTarget};
use crate::error::LibrarianError;
use crate::fsutil::write_atomic_text_file;
use crate::generate::ContainerConfig;
use crate::health::{FailedLevel, HealthCheckResult, HealthReport, HealthStatus, HealthTarget};
use crate::model::Runtime;
use crate::platforms::PlatformId;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

pub const REGISTRY_VERSION: u32 = 1;
pub const REGISTRY_FILE_NAME: &str = "registry.json";
const MAX_TRIGGERS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ServerStatus {
    Active,
    Stopped,
    Unhealthy,
    Error,
    SourceMissing,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
            Self::SourceMissing => "source_missing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSummary {
    pub last_check: Option<DateTime<Utc>>,
    pub last_status: HealthStatus,
    pub last_response_ms: Option<u64>,
    pub failed_level: Option<FailedLevel>,
    pub consecutive_failures: u32,
    pub total_checks: u32,
}

impl Default for HealthSummary {
    fn default() -> Self {
        Self {
            last_check: None,
            last_status: HealthStatus::Unknown,
            last_response_ms: None,
            failed_level: None,
            consecutive_failures: 0,
            total_checks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: Uuid,
    pub name: String,
    pub source_path: PathBuf,
    pub runtime: Runtime,
    pub config_path: PathBuf,
    pub compose_path: PathBuf,
    pub image: String,
    pub project: String,
    #[serde(default)]
    pub registered_platforms: Vec<PlatformId>,
    pub status: ServerStatus,
    #[serde(default)]
    pub triggers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub health: HealthSummary,
    #[serde(default)]
    pub health_history: Vec<HealthCheckResult>,
}

impl RegistryEntry {
    pub fn new(source_path: &Path, runtime: Runtime, config: &ContainerConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: config.service.clone(),
            source_path: source_path.to_path_buf(),
            runtime,
            config_path: config.config_dir.clone(),
            compose_path: config.compose_file.clone(),
            image: config.image.clone(),
            project: project_name(&config.service),
            registered_platforms: Vec::new(),
            status: ServerStatus::Active,
            triggers: Vec::new(),
            created_at: now,
            updated_at: now,
            health: HealthSummary::default(),
            health_history: Vec::new(),
        }
    }

    pub fn compose_target(&self) -> ComposeTarget {
        ComposeTarget::new(&self.compose_path, &self.name)
    }

    pub fn health_target(&self) -> HealthTarget {
        HealthTarget {
            name: self.name.clone(),
            source_path: self.source_path.clone(),
            compose: self.compose_target(),
        }
    }

    /// Folds one check into the summary, status and capped history.
    pub fn record_health(&mut self, report: &HealthReport, history_limit: usize) {
        let result = &report.result;
        let passing = matches!(result.status, HealthStatus::Healthy | HealthStatus::Degraded);
        self.health.last_check = Some(result.checked_at);
        self.health.last_status = result.status;
        self.health.last_response_ms = result.protocol_responds.then_some(result.response_time_ms);
        self.health.failed_level = result.failed_level;
        self.health.total_checks += 1;
        if passing {
            self.health.consecutive_failures = 0;
        } else {
            self.health.consecutive_failures += 1;
        }

        self.status = match result.status {
            HealthStatus::Healthy | HealthStatus::Degraded => ServerStatus::Active,
            HealthStatus::Unhealthy => ServerStatus::Unhealthy,
            HealthStatus::Stopped => ServerStatus::Stopped,
            HealthStatus::Unknown if report.source_missing() => ServerStatus::SourceMissing,
            HealthStatus::Unknown => self.status,
        };
        if !report.tool_names.is_empty() {
            self.triggers = suggest_triggers(&self.name, &report.tool_names);
        }

        self.health_history.push(result.clone());
        if self.health_history.len() > history_limit {
            let excess = self.health_history.len() - history_limit;
            self.health_history.drain(..excess);
        }
        self.updated_at = Utc::now();
    }
}

/// Name variants plus the longer words of every tool name, sorted and capped.
pub fn suggest_triggers(name: &str, tool_names: &[String]) -> Vec<String> {
    let mut triggers = BTreeSet::new();
    let lowered = name.to_lowercase();
    triggers.insert(lowered.clone());
    let spaced = lowered.replace(['-', '_'], " ");
    triggers.insert(spaced.clone());
    let stripped: Vec<&str> = spaced
        .split_whitespace()
        .filter(|word| *word != "mcp" && *word != "server")
        .collect();
    if !stripped.is_empty() {
        triggers.insert(stripped.join(" "));
    }
    for tool in tool_names {
        for word in tool.split(|ch: char| !ch.is_ascii_alphanumeric()) {
            if word.chars().count() > 3 {
                triggers.insert(word.to_lowercase());
            }
        }
    }
    triggers.into_iter().take(MAX_TRIGGERS).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryFile {
    pub version: u32,
    #[serde(default)]
    pub servers: BTreeMap<String, RegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            servers: BTreeMap::new(),
        }
    }
}

/// The on-disk registry. Every mutation is a locked load-modify-save cycle
/// ending in an atomic rename.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(config_root: &Path) -> Self {
        Self {
            path: config_root.join(REGISTRY_FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RegistryFile, LibrarianError> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|err| {
            LibrarianError::Registry(format!("failed to read {}: {err}", self.path.display()))
        })?;
        let file: RegistryFile = serde_json::from_str(&content).map_err(|err| {
            LibrarianError::Registry(format!("{} is not valid: {err}", self.path.display()))
        })?;
        if file.version != REGISTRY_VERSION {
            return Err(LibrarianError::Registry(format!(
                "unsupported registry version {} in {} (expected {REGISTRY_VERSION})",
                file.version,
                self.path.display()
            )));
        }
        Ok(file)
    }

    pub fn save(&self, file: &RegistryFile) -> Result<(), LibrarianError> {
        let body = serde_json::to_string_pretty(file)?;
        write_atomic_text_file(&self.path, &format!("{body}\n"), Some(0o600)).map_err(|err| {
            LibrarianError::Registry(format!("failed to write {}: {err}", self.path.display()))
        })
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RegistryFile) -> Result<T, LibrarianError>,
    ) -> Result<T, LibrarianError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let value = change(&mut file)?;
        self.save(&file)?;
        Ok(value)
    }

    pub fn add(&self, entry: RegistryEntry) -> Result<(), LibrarianError> {
        self.mutate(|file| {
            if file.servers.contains_key(&entry.name) {
                return Err(LibrarianError::AlreadyRegistered(entry.name.clone()));
            }
            debug!(server = %entry.name, "registry add");
            file.servers.insert(entry.name.clone(), entry);
            Ok(())
        })
    }

    /// Replaces an existing entry in place. Identity, creation time and
    /// platform registrations carry over; checks recorded on `entry` are
    /// appended to the previous history and its summary wins.
    pub fn add_or_replace(&self, mut entry: RegistryEntry, history_limit: usize) -> Result<(), LibrarianError> {
        self.mutate(|file| {
            if let Some(previous) = file.servers.remove(&entry.name) {
                entry.id = previous.id;
                entry.created_at = previous.created_at;
                for id in previous.registered_platforms {
                    if !entry.registered_platforms.contains(&id) {
                        entry.registered_platforms.push(id);
                    }
                }
                entry.registered_platforms.sort();
                if entry.health.total_checks == 0 {
                    entry.health = previous.health;
                    entry.health_history = previous.health_history;
                } else {
                    // A fresh run that never passed extends the previous failure streak.
                    if entry.health.consecutive_failures == entry.health.total_checks {
                        entry.health.consecutive_failures += previous.health.consecutive_failures;
                    }
                    entry.health.total_checks += previous.health.total_checks;
                    let mut history = previous.health_history;
                    history.append(&mut entry.health_history);
                    if history.len() > history_limit {
                        history.drain(..history.len() - history_limit);
                    }
                    entry.health_history = history;
                }
            }
            debug!(server = %entry.name, "registry upsert");
            file.servers.insert(entry.name.clone(), entry);
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<RegistryEntry>, LibrarianError> {
        Ok(self.load()?.servers.remove(name))
    }

    pub fn require(&self, name: &str) -> Result<RegistryEntry, LibrarianError> {
        self.get(name)?
            .ok_or_else(|| LibrarianError::NotRegistered(name.to_string()))
    }

    pub fn list_all(&self) -> Result<Vec<RegistryEntry>, LibrarianError> {
        Ok(self.load()?.servers.into_values().collect())
    }

    pub fn remove(&self, name: &str) -> Result<RegistryEntry, LibrarianError> {
        self.mutate(|file| {
            file.servers
                .remove(name)
                .ok_or_else(|| LibrarianError::NotRegistered(name.to_string()))
        })
    }

    pub fn update_health(
        &self,
        name: &str,
        report: &HealthReport,
        history_limit: usize,
    ) -> Result<RegistryEntry, LibrarianError> {
        self.mutate(|file| {
            let entry = file
                .servers
                .get_mut(name)
                .ok_or_else(|| LibrarianError::NotRegistered(name.to_string()))?;
            entry.record_health(report, history_limit);
            Ok(entry.clone())
        })
    }

    /// Adds `platforms` to the entry's registrations, keeping earlier ones.
    pub fn add_platforms(&self, name: &str, platforms: &[PlatformId]) -> Result<(), LibrarianError> {
        self.mutate(|file| {
            let entry = file
                .servers
                .get_mut(name)
                .ok_or_else(|| LibrarianError::NotRegistered(name.to_string()))?;
            entry.registered_platforms.extend_from_slice(platforms);
            entry.registered_platforms.sort();
            entry.registered_platforms.dedup();
            entry.updated_at = Utc::now();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::TemplateVariant;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn entry(root: &Path, name: &str) -> RegistryEntry {
        let config = ContainerConfig::for_service(root, name, TemplateVariant::NodeSelfContained);
        RegistryEntry::new(&root.join("src").join(name), Runtime::Node, &config)
    }

    fn report(status: HealthStatus, ms: u64) -> HealthReport {
        HealthReport {
            result: HealthCheckResult {
                server_name: "weather".to_string(),
                container_running: status != HealthStatus::Stopped,
                protocol_responds: matches!(status, HealthStatus::Healthy | HealthStatus::Degraded),
                tools_available: matches!(status, HealthStatus::Healthy | HealthStatus::Degraded),
                response_time_ms: ms,
                tool_count: 1,
                status,
                failed_level: None,
                error_message: String::new(),
                checked_at: Utc::now(),
            },
            tool_names: vec!["get_forecast".to_string()],
            recovered: None,
        }
    }

    #[test]
    fn add_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        let added = entry(dir.path(), "weather");
        store.add(added.clone()).unwrap();
        assert_eq!(store.get("weather").unwrap(), Some(added.clone()));

        let removed = store.remove("weather").unwrap();
        assert_eq!(removed, added);
        assert_eq!(store.get("weather").unwrap(), None);
        assert!(matches!(store.remove("weather"), Err(LibrarianError::NotRegistered(_))));
    }

    #[test]
    fn duplicate_add_is_rejected_and_file_untouched() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.add(entry(dir.path(), "weather")).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();
        let err = store.add(entry(dir.path(), "weather")).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ALREADY_REGISTERED);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn replace_keeps_identity() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        let first = entry(dir.path(), "weather");
        store.add(first.clone()).unwrap();
        store.add_or_replace(entry(dir.path(), "weather"), 168).unwrap();
        let current = store.require("weather").unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(current.created_at, first.created_at);
    }

    #[test]
    fn replace_keeps_fresh_health_and_extends_history() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.add(entry(dir.path(), "weather")).unwrap();
        store.add_platforms("weather", &[PlatformId::Cursor]).unwrap();
        for _ in 0..3 {
            store.update_health("weather", &report(HealthStatus::Unhealthy, 0), 3).unwrap();
        }

        let mut rewrapped = entry(dir.path(), "weather");
        rewrapped.record_health(&report(HealthStatus::Healthy, 40), 3);
        store.add_or_replace(rewrapped, 3).unwrap();

        let current = store.require("weather").unwrap();
        assert_eq!(current.status, ServerStatus::Active);
        assert_eq!(current.health.last_status, HealthStatus::Healthy);
        assert_eq!(current.health.last_response_ms, Some(40));
        assert_eq!(current.health.consecutive_failures, 0);
        assert_eq!(current.health.total_checks, 4);
        assert_eq!(current.health_history.len(), 3);
        assert_eq!(current.health_history.last().unwrap().status, HealthStatus::Healthy);
        assert_eq!(current.registered_platforms, vec![PlatformId::Cursor]);
    }

    #[test]
    fn replace_without_fresh_check_keeps_previous_health() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.add(entry(dir.path(), "weather")).unwrap();
        store.update_health("weather", &report(HealthStatus::Degraded, 6_000), 168).unwrap();

        store.add_or_replace(entry(dir.path(), "weather"), 168).unwrap();
        let current = store.require("weather").unwrap();
        assert_eq!(current.health.total_checks, 1);
        assert_eq!(current.health.last_status, HealthStatus::Degraded);
        assert_eq!(current.health_history.len(), 1);
    }

    #[test]
    fn concurrent_adds_keep_every_entry() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::new(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let root = dir.path().to_path_buf();
                thread::spawn(move || store.add(entry(&root, &format!("server-{i}"))).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.list_all().unwrap().len(), 8);
    }

    #[test]
    fn health_updates_status_and_prunes_history() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        store.add(entry(dir.path(), "weather")).unwrap();

        for _ in 0..5 {
            store.update_health("weather", &report(HealthStatus::Unhealthy, 0), 3).unwrap();
        }
        let current = store.require("weather").unwrap();
        assert_eq!(current.status, ServerStatus::Unhealthy);
        assert_eq!(current.health_history.len(), 3);
        assert_eq!(current.health.consecutive_failures, 5);
        assert_eq!(current.health.total_checks, 5);

        let current = store.update_health("weather", &report(HealthStatus::Degraded, 7_000), 3).unwrap();
        assert_eq!(current.status, ServerStatus::Active);
        assert_eq!(current.health.consecutive_failures, 0);
        assert_eq!(current.health.last_response_ms, Some(7_000));
        assert!(current.triggers.contains(&"forecast".to_string()));

        let current = store.update_health("weather", &report(HealthStatus::Stopped, 0), 3).unwrap();
        assert_eq!(current.status, ServerStatus::Stopped);
    }

    #[test]
    fn unknown_without_source_marks_source_missing() {
        let dir = tempdir().unwrap();
        let mut entry = entry(dir.path(), "weather");
        let mut missing = report(HealthStatus::Unknown, 0);
        missing.result.error_message = "Source directory not found".to_string();
        missing.tool_names.clear();
        entry.record_health(&missing, 168);
        assert_eq!(entry.status, ServerStatus::SourceMissing);
        assert!(entry.triggers.is_empty());
    }

    #[test]
    fn corrupt_registry_is_a_registry_error() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        let err = store.list_all().unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_REGISTRY);
    }

    #[test]
    fn triggers_are_sorted_and_capped() {
        let tools: Vec<String> = [
            "get_forecast",
            "list_alerts",
            "search_locations",
            "read_station_history",
            "fetch_radar_image",
            "convert_units",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let triggers = suggest_triggers("weather-mcp", &tools);
        assert_eq!(triggers.len(), 10);
        let mut sorted = triggers.clone();
        sorted.sort();
        assert_eq!(triggers, sorted);
        assert!(!triggers.iter().any(|t| t == "get"));
        assert!(suggest_triggers("weather-mcp", &[]).contains(&"weather".to_string()));
    }
}
