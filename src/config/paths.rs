// SPDX-License-Identifier: GPL-3.0-only

//! Centralized path constants, mirroring `rpi_logger/core/paths.py`.
//!
//! `USER_STATE_DIR` is used rather than a project-root-relative state file so
//! the supervisor keeps working when installed somewhere read-only.

use std::path::PathBuf;

const ENV_STATE_DIR: &str = "SESSION_CAPTURE_STATE_DIR";
const APP_DIR_NAME: &str = "session-capture";

/// Root directory for all mutable, user-scoped state: recovery snapshot,
/// config overrides, per-module config and logs.
pub fn user_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn user_config_overrides_dir() -> PathBuf {
    user_state_dir().join("config_overrides")
}

pub fn user_module_config_dir() -> PathBuf {
    user_state_dir().join("module_configs")
}

pub fn user_module_logs_dir() -> PathBuf {
    user_state_dir().join("module_logs")
}

/// Crash-recovery snapshot: `{timestamp, running_modules}`.
pub fn recovery_state_file() -> PathBuf {
    user_state_dir().join("running_modules.json")
}

/// Create every directory this module needs, idempotently.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(user_state_dir())?;
    std::fs::create_dir_all(user_config_overrides_dir())?;
    std::fs::create_dir_all(user_module_config_dir())?;
    std::fs::create_dir_all(user_module_logs_dir())?;
    Ok(())
}
