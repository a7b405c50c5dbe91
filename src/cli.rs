// SPDX-License-Identifier: GPL-3.0-only

//! Supervisor CLI surface. Grounded on the teacher's `clap::{Parser, Subcommand}`
//! derive pattern in `main.rs`/`cli.rs`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Fixed resolution preset table, indexed by `--resolution`.
pub const RESOLUTION_PRESETS: &[(u32, u32)] = &[
    (1456, 1088),
    (1280, 960),
    (1280, 720),
    (1024, 768),
    (800, 600),
    (640, 480),
    (480, 360),
    (320, 240),
];

pub fn resolve_resolution_preset(preset: u8) -> Option<(u32, u32)> {
    RESOLUTION_PRESETS.get(preset as usize).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Gui,
    Headless,
    Slave,
    Interactive,
    Demo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "supervisor")]
#[command(about = "Module supervisor for multi-modal research sessions")]
#[command(version = env!("GIT_VERSION"))]
pub struct Cli {
    /// Root directory new sessions are created under.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Overrides RUST_LOG with an explicit filter directive.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Redirects log output to this file (append mode) instead of stderr.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "headless")]
    pub mode: RunMode,

    /// Session directory name prefix, sanitized before use.
    #[arg(long, default_value = "session")]
    pub session_prefix: String,

    #[arg(long, default_value_t = true, overrides_with = "no_console")]
    pub console: bool,

    #[arg(long, default_value_t = false, overrides_with = "console")]
    pub no_console: bool,

    #[arg(long, default_value_t = false, overrides_with = "no_auto_start_recording")]
    pub auto_start_recording: bool,

    #[arg(long, default_value_t = false, overrides_with = "auto_start_recording")]
    pub no_auto_start_recording: bool,

    /// Accept module commands over the control channel even in headless mode.
    #[arg(long, default_value_t = false)]
    pub enable_commands: bool,

    /// `WxH+X+Y` window geometry, forwarded to modules with a UI.
    #[arg(long, value_name = "GEOMETRY")]
    pub window_geometry: Option<String>,

    /// Index into the fixed resolution preset table (0-7).
    #[arg(long, value_name = "PRESET")]
    pub resolution: Option<u8>,

    #[arg(long)]
    pub target_fps: Option<f64>,

    #[arg(long)]
    pub sample_rate: Option<u32>,
}

impl Cli {
    pub fn auto_start_recording_enabled(&self) -> bool {
        self.auto_start_recording && !self.no_auto_start_recording
    }

    pub fn console_enabled(&self) -> bool {
        self.console && !self.no_console
    }
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_preset_table_has_eight_fixed_entries() {
        assert_eq!(RESOLUTION_PRESETS.len(), 8);
        assert_eq!(resolve_resolution_preset(2), Some((1280, 720)));
        assert_eq!(resolve_resolution_preset(7), Some((320, 240)));
        assert_eq!(resolve_resolution_preset(8), None);
    }

    #[test]
    fn log_level_maps_to_filter_directive() {
        assert_eq!(LogLevel::Warning.as_filter_directive(), "warn");
        assert_eq!(LogLevel::Critical.as_filter_directive(), "error");
    }
}
