// SPDX-License-Identifier: GPL-3.0-only

//! Config & State Store (`spec.md` §4.A).
//!
//! Source of truth for persisted booleans and small scalars per module
//! (`enabled`, `device_connected`, `window_geometry`) plus a process-wide
//! recovery file listing running modules. Grounded on
//! `rpi_logger/core/config_manager.py` and `rpi_logger/core/state_persistence.py`.

pub mod paths;

use crate::errors::{AppError, AppResult};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Application lifecycle phases gating whether state writes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Persisted per-module state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleStateSnapshot {
    pub enabled: bool,
    pub device_connected: bool,
}

/// Parses/writes `key = value` text config files with a SHA-1-keyed override
/// fallback, and the process-wide recovery snapshot.
pub struct ConfigManager {
    phase: StdMutex<AppPhase>,
    write_lock: Mutex<()>,
    crashed_modules: StdMutex<HashSet<String>>,
    forcefully_stopped: StdMutex<HashSet<String>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            phase: StdMutex::new(AppPhase::Initializing),
            write_lock: Mutex::new(()),
            crashed_modules: StdMutex::new(HashSet::new()),
            forcefully_stopped: StdMutex::new(HashSet::new()),
        }
    }

    pub fn phase(&self) -> AppPhase {
        *self.phase.lock().unwrap()
    }

    pub fn enter_running_phase(&self) {
        *self.phase.lock().unwrap() = AppPhase::Running;
        info!("state phase: running");
    }

    pub fn enter_shutdown_phase(&self) {
        *self.phase.lock().unwrap() = AppPhase::ShuttingDown;
        info!("state phase: shutting_down - device state will be preserved");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() == AppPhase::ShuttingDown
    }

    // -- key=value parsing -------------------------------------------------

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
        let mut config = HashMap::new();
        for raw_line in lines {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, mut value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            value = value.trim();
            let value = if let Some(idx) = value.find('#') {
                value[..idx].trim()
            } else {
                value
            };
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            config.insert(key, value.to_string());
        }
        config
    }

    fn stringify(value: &str) -> String {
        value.to_string()
    }

    fn override_path(config_path: &Path) -> PathBuf {
        let digest = {
            let mut hasher = Sha1::new();
            hasher.update(config_path.to_string_lossy().as_bytes());
            let bytes = hasher.finalize();
            bytes.iter().take(5).map(|b| format!("{b:02x}")).collect::<String>()
        };
        let stem = config_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let safe_name: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let ext = config_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".txt".to_string());
        paths::user_config_overrides_dir().join(format!("{safe_name}_{digest}{ext}"))
    }

    fn load_override_sync(config_path: &Path) -> HashMap<String, String> {
        let override_path = Self::override_path(config_path);
        match std::fs::read_to_string(&override_path) {
            Ok(contents) => Self::parse_lines(contents.lines()),
            Err(_) => HashMap::new(),
        }
    }

    fn write_override_sync(config_path: &Path, updates: &HashMap<String, String>) -> bool {
        if updates.is_empty() {
            return true;
        }
        let override_path = Self::override_path(config_path);
        let mut existing = Self::load_override_sync(config_path);
        for (k, v) in updates {
            existing.insert(k.clone(), v.clone());
        }
        if let Some(parent) = override_path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            error!(path = %override_path.display(), error = %e, "failed to create override dir");
            return false;
        }
        let mut keys: Vec<&String> = existing.keys().collect();
        keys.sort();
        let mut body = String::new();
        for key in keys {
            body.push_str(&format!("{key} = {}\n", existing[key]));
        }
        match atomic_write(&override_path, body.as_bytes()) {
            Ok(()) => {
                debug!(path = %override_path.display(), "stored config overrides");
                true
            }
            Err(e) => {
                error!(path = %override_path.display(), error = %e, "failed to write config override");
                false
            }
        }
    }

    fn clear_override(config_path: &Path) {
        let override_path = Self::override_path(config_path);
        let _ = std::fs::remove_file(override_path);
    }

    /// Read a config file, layering any override on top. Missing files and
    /// read errors both yield defaults (an empty map); never an error.
    pub fn read_config(&self, config_path: &Path) -> HashMap<String, String> {
        let mut config = if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => Self::parse_lines(contents.lines()),
                Err(e) => {
                    error!(path = %config_path.display(), error = %e, "failed to read config");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        let overrides = Self::load_override_sync(config_path);
        config.extend(overrides);
        config
    }

    /// Write `updates` into `config_path`, preserving unrelated keys and
    /// comments. Falls back to the override file when the target is
    /// read-only or missing.
    pub async fn write_config(&self, config_path: &Path, updates: HashMap<String, String>) -> bool {
        let _guard = self.write_lock.lock().await;
        if !config_path.exists() {
            warn!(path = %config_path.display(), "config file not found, writing override only");
            return Self::write_override_sync(config_path, &updates);
        }

        let contents = match std::fs::read_to_string(config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %config_path.display(), error = %e, "failed to read config for update");
                return Self::write_override_sync(config_path, &updates);
            }
        };

        let mut lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();
        let mut updated_keys = HashSet::new();
        for line in lines.iter_mut() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') || !stripped.contains('=') {
                continue;
            }
            let key = stripped.split('=').next().unwrap().trim().to_string();
            if let Some(value) = updates.get(&key) {
                let indent = line.len() - line.trim_start().len();
                *line = format!("{}{key} = {}", " ".repeat(indent), Self::stringify(value));
                updated_keys.insert(key);
            }
        }
        for (key, value) in &updates {
            if !updated_keys.contains(key) {
                lines.push(format!("{key} = {value}"));
                debug!(key, value, "added new config key");
            }
        }
        let mut body = lines.join("\n");
        body.push('\n');

        match atomic_write(config_path, body.as_bytes()) {
            Ok(()) => {
                Self::clear_override(config_path);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(path = %config_path.display(), "config not writable, falling back to override");
                Self::write_override_sync(config_path, &updates)
            }
            Err(e) => {
                error!(path = %config_path.display(), error = %e, "failed to write config");
                false
            }
        }
    }

    pub fn get_bool(config: &HashMap<String, String>, key: &str, default: bool) -> bool {
        match config.get(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            None => default,
        }
    }

    pub fn get_str<'a>(config: &'a HashMap<String, String>, key: &str, default: &'a str) -> &'a str {
        config.get(key).map(|s| s.as_str()).unwrap_or(default)
    }

    // -- per-module event handlers (spec.md §4.A public contract) ----------

    pub async fn load_module_state(&self, config_path: Option<&Path>) -> ModuleStateSnapshot {
        let Some(path) = config_path else {
            return ModuleStateSnapshot::default();
        };
        let config = self.read_config(path);
        ModuleStateSnapshot {
            enabled: Self::get_bool(&config, "enabled", false),
            device_connected: Self::get_bool(&config, "device_connected", false),
        }
    }

    pub async fn on_device_connected(&self, module_name: &str, config_path: &Path) {
        if self.is_shutting_down() {
            info!(module_name, "persist skip: device_connected=true (shutting down)");
            return;
        }
        self.crashed_modules.lock().unwrap().remove(module_name);
        self.write_flag(module_name, config_path, "device_connected", true).await;
    }

    pub async fn on_user_disconnect(&self, module_name: &str, config_path: &Path) {
        if self.is_shutting_down() {
            info!(module_name, "persist skip: disconnect (shutting down)");
            return;
        }
        self.write_flag(module_name, config_path, "device_connected", false).await;
        self.write_flag(module_name, config_path, "enabled", false).await;
    }

    pub async fn on_internal_module_closed(&self, module_name: &str, config_path: &Path) {
        if self.is_shutting_down() {
            info!(module_name, "persist skip: internal close (shutting down)");
            return;
        }
        self.write_flag(module_name, config_path, "device_connected", false).await;
    }

    pub async fn on_module_crash(&self, module_name: &str, config_path: &Path) {
        if self.is_shutting_down() {
            info!(module_name, "persist skip: crash (shutting down)");
            return;
        }
        self.crashed_modules.lock().unwrap().insert(module_name.to_string());
        self.write_flag(module_name, config_path, "enabled", false).await;
        warn!(module_name, "module crashed - disabled for next startup");
    }

    pub async fn on_user_toggle_enabled(&self, module_name: &str, config_path: &Path, enabled: bool) {
        self.write_flag(module_name, config_path, "enabled", enabled).await;
    }

    async fn write_flag(&self, module_name: &str, config_path: &Path, key: &str, value: bool) {
        let mut updates = HashMap::new();
        updates.insert(key.to_string(), value.to_string());
        let ok = self.write_config(config_path, updates).await;
        if ok {
            info!(module_name, key, value, "persisted module flag");
        } else {
            error!(module_name, key, value, "failed to persist module flag");
        }
    }

    pub fn mark_forcefully_stopped(&self, module_name: &str) {
        self.forcefully_stopped.lock().unwrap().insert(module_name.to_string());
        info!(module_name, "marked as forcefully stopped");
    }

    // -- recovery file -------------------------------------------------------

    pub async fn load_recovery_state(&self) -> Option<HashSet<String>> {
        let path = paths::recovery_state_file();
        if !path.exists() {
            info!("recovery: no recovery file found - fresh start");
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RecoverySnapshot>(&contents) {
                Ok(snapshot) => {
                    info!(count = snapshot.running_modules.len(), timestamp = %snapshot.timestamp, "recovery: found modules");
                    Some(snapshot.running_modules.into_iter().collect())
                }
                Err(e) => {
                    error!(error = %e, "recovery: failed to parse");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "recovery: failed to load");
                None
            }
        }
    }

    pub async fn save_startup_snapshot(&self, running_modules: &HashSet<String>) -> bool {
        self.write_recovery_file(running_modules.clone()).await
    }

    pub async fn save_shutdown_snapshot(&self, running_modules: &HashSet<String>) -> bool {
        let crashed = self.crashed_modules.lock().unwrap().clone();
        let forced = self.forcefully_stopped.lock().unwrap().clone();
        let filtered: HashSet<String> = running_modules
            .iter()
            .filter(|m| !crashed.contains(*m) && !forced.contains(*m))
            .cloned()
            .collect();
        if filtered.len() != running_modules.len() {
            info!(
                dropped = running_modules.len() - filtered.len(),
                "recovery: filtered crashed/forced modules from snapshot"
            );
        }
        self.write_recovery_file(filtered).await
    }

    pub async fn delete_recovery_file(&self) -> bool {
        let path = paths::recovery_state_file();
        if !path.exists() {
            return true;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("recovery: deleted recovery file");
                true
            }
            Err(e) => {
                error!(error = %e, "recovery: failed to delete");
                false
            }
        }
    }

    async fn write_recovery_file(&self, running_modules: HashSet<String>) -> bool {
        if running_modules.is_empty() {
            return self.delete_recovery_file().await;
        }
        let _guard = self.write_lock.lock().await;
        let path = paths::recovery_state_file();
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            error!(error = %e, "recovery: failed to create state dir");
            return false;
        }
        let mut modules: Vec<String> = running_modules.into_iter().collect();
        modules.sort();
        let snapshot = RecoverySnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            running_modules: modules.clone(),
        };
        let body = match serde_json::to_vec_pretty(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "recovery: failed to serialize");
                return false;
            }
        };
        match atomic_write(&path, &body) {
            Ok(()) => {
                info!(count = modules.len(), "recovery: saved modules");
                true
            }
            Err(e) => {
                error!(error = %e, "recovery: failed to write");
                false
            }
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct RecoverySnapshot {
    timestamp: String,
    running_modules: Vec<String>,
}

/// Write `contents` to `path` via a sibling temp file, `fsync`, then rename —
/// so readers never observe a partially written file.
fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("config"),
        std::process::id()
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines_handles_comments_and_quotes() {
        let parsed = ConfigManager::parse_lines(
            ["# comment", "", "enabled = true", "name = \"hi there\" # trailing"].into_iter(),
        );
        assert_eq!(parsed.get("enabled").unwrap(), "true");
        assert_eq!(parsed.get("name").unwrap(), "hi there");
    }

    #[test]
    fn get_bool_recognizes_truthy_variants() {
        let mut config = HashMap::new();
        config.insert("a".to_string(), "YES".to_string());
        config.insert("b".to_string(), "0".to_string());
        assert!(ConfigManager::get_bool(&config, "a", false));
        assert!(!ConfigManager::get_bool(&config, "b", true));
        assert!(!ConfigManager::get_bool(&config, "missing", false));
    }

    #[test]
    fn override_path_is_stable_for_same_input() {
        let p = Path::new("/etc/readonly/config.txt");
        assert_eq!(ConfigManager::override_path(p), ConfigManager::override_path(p));
    }

    #[tokio::test]
    async fn write_config_preserves_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, "enabled = false\nsample_rate = 48000\n").unwrap();

        let manager = ConfigManager::new();
        let mut updates = HashMap::new();
        updates.insert("enabled".to_string(), "true".to_string());
        assert!(manager.write_config(&path, updates).await);

        let config = manager.read_config(&path);
        assert_eq!(config.get("enabled").unwrap(), "true");
        assert_eq!(config.get("sample_rate").unwrap(), "48000");
    }
}
