// SPDX-License-Identifier: GPL-3.0-only

//! Session & trial filesystem layout.
//!
//! Pure path logic: sanitizing user-controlled name fragments and deriving
//! the on-disk tree for a session/trial. Grounded on `io_utils.py`'s
//! `sanitize_path_component`.

use crate::errors::{AppError, AppResult};
use std::path::{Path, PathBuf};

/// Restricts a user-controlled name fragment (session prefix, module name)
/// to a safe filesystem component: no separators, no traversal, no nulls.
pub fn sanitize_path_component(name: &str) -> String {
    let stripped: String = name.chars().filter(|c| *c != '\0').collect();
    let replaced: String = stripped
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    let mut run = String::new();
    for c in replaced.chars() {
        if c == '.' {
            run.push(c);
        } else {
            if run.len() >= 2 {
                collapsed.push_str(&"_".repeat(run.len()));
            } else {
                collapsed.push_str(&run);
            }
            run.clear();
            collapsed.push(c);
        }
    }
    if run.len() >= 2 {
        collapsed.push_str(&"_".repeat(run.len()));
    } else {
        collapsed.push_str(&run);
    }

    let restricted: String = collapsed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();

    let trimmed = restricted.trim_start_matches('.');
    if trimmed.is_empty() {
        "experiment".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolved filesystem paths for one camera's recording in one trial.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session_dir: PathBuf,
    pub camera_dir: PathBuf,
    pub video_path: PathBuf,
    pub timing_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Creates the session directory for this run.
///
/// `command_mode=true` (slave mode, driven by an external supervisor) uses
/// `output_root` directly. Otherwise derives a timestamped child directory
/// and validates it resolves under `output_root` before creating it.
pub fn create_session_dir(
    output_root: &Path,
    prefix: &str,
    timestamp: &str,
    command_mode: bool,
) -> AppResult<PathBuf> {
    if command_mode {
        std::fs::create_dir_all(output_root)?;
        return Ok(output_root.to_path_buf());
    }

    let safe_prefix = sanitize_path_component(prefix);
    let session_name = format!("{safe_prefix}_{timestamp}");
    let session_dir = output_root.join(&session_name);

    std::fs::create_dir_all(&session_dir)?;

    let canonical_root = output_root
        .canonicalize()
        .map_err(|_| AppError::InvalidSessionPath(session_dir.clone()))?;
    let canonical_child = session_dir
        .canonicalize()
        .map_err(|_| AppError::InvalidSessionPath(session_dir.clone()))?;
    if !canonical_child.starts_with(&canonical_root) {
        return Err(AppError::InvalidSessionPath(session_dir));
    }

    Ok(session_dir)
}

/// Derives the deterministic per-camera, per-trial filename set from §6.2's
/// naming grammar: `{timestamp}_{kind}_trial{NNN}_{camera_key}_{WxH}_{fps}.{ext}`.
pub fn resolve_trial_paths(
    session_dir: &Path,
    camera_key: &str,
    trial_number: u32,
    width: u32,
    height: u32,
    fps: f64,
    timestamp: &str,
) -> SessionPaths {
    let camera_dir = session_dir.join("Cameras");
    let safe_camera = sanitize_path_component(camera_key);
    let stem = format!("{timestamp}_CAM_trial{trial_number:03}_{safe_camera}_{width}x{height}_{fps:.0}");

    SessionPaths {
        session_dir: session_dir.to_path_buf(),
        camera_dir: camera_dir.clone(),
        video_path: camera_dir.join(format!("{stem}.mp4")),
        timing_path: camera_dir.join(format!("{timestamp}_CAMTIMING_trial{trial_number:03}_{safe_camera}.csv")),
        metadata_path: camera_dir.join(format!("{stem}.json")),
    }
}

pub fn create_trial_dirs(paths: &SessionPaths) -> std::io::Result<()> {
    std::fs::create_dir_all(&paths.camera_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_traversal() {
        assert_eq!(sanitize_path_component("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_path_component("a/b\\c"), "a_b_c");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for name in ["normal_name", "../evil", "...", "", "CAM-01.left"] {
            let once = sanitize_path_component(name);
            let twice = sanitize_path_component(&once);
            assert_eq!(once, twice, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn sanitize_empty_falls_back_to_experiment() {
        assert_eq!(sanitize_path_component(""), "experiment");
        assert_eq!(sanitize_path_component("..."), "experiment");
    }

    #[test]
    fn create_session_dir_rejects_traversal_prefix() {
        let dir = tempfile::tempdir().unwrap();
        // sanitize_path_component already strips slashes, so a direct
        // traversal attempt collapses into a harmless sibling name; this
        // exercises the canonicalization guard defensively.
        let result = create_session_dir(dir.path(), "pilot", "20260101_120000", false);
        assert!(result.is_ok());
        assert!(result.unwrap().starts_with(dir.path()));
    }

    #[test]
    fn resolve_trial_paths_follows_naming_grammar() {
        let paths = resolve_trial_paths(
            Path::new("/data/pilot_20260101_120000"),
            "usb:1-2",
            3,
            1280,
            720,
            30.0,
            "20260101_120005",
        );
        assert_eq!(
            paths.video_path,
            Path::new("/data/pilot_20260101_120000/Cameras/20260101_120005_CAM_trial003_usb_1-2_1280x720_30.mp4")
        );
        assert_eq!(
            paths.timing_path,
            Path::new("/data/pilot_20260101_120000/Cameras/20260101_120005_CAMTIMING_trial003_usb_1-2.csv")
        );
    }
}
