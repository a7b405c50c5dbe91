// SPDX-License-Identifier: GPL-3.0-only

//! Core camera data types shared by backends, router, and pipelines.

use std::collections::HashMap;
use std::fmt;

/// Which discovery mechanism produced a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Usb,
    Csi,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "usb"),
            Self::Csi => write!(f, "csi"),
        }
    }
}

/// Identifies one camera device, stable across replug when derived from the
/// USB bus/port path (Linux) or sensor index (CSI).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CameraId {
    pub backend: BackendKind,
    pub stable_id: String,
    pub dev_path: Option<String>,
    pub friendly_name: Option<String>,
}

impl CameraId {
    pub fn new(backend: BackendKind, stable_id: impl Into<String>) -> Self {
        Self {
            backend,
            stable_id: stable_id.into(),
            dev_path: None,
            friendly_name: None,
        }
    }

    /// The `"{backend}:{stable_id}"` map key used throughout the runtime.
    pub fn key(&self) -> String {
        format!("{}:{}", self.backend, self.stable_id)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ColorFormat {
    Bgr,
    Rgb,
}

impl ColorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bgr => "bgr",
            Self::Rgb => "rgb",
        }
    }
}

/// One discrete (resolution, fps, pixel format, controls) combination a
/// camera can be opened with. Immutable after probe.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CapabilityMode {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: String,
    #[serde(default)]
    pub controls: HashMap<String, String>,
}

impl CapabilityMode {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_16_9(&self) -> bool {
        if self.height == 0 {
            return false;
        }
        let ratio = self.width as f64 / self.height as f64;
        (ratio - 16.0 / 9.0).abs() < 0.02
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilitySource {
    Probe,
    Cache,
}

/// The full set of modes a camera supports, plus chosen defaults.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CameraCapabilities {
    pub modes: Vec<CapabilityMode>,
    pub source: CapabilitySource,
    pub timestamp_ms: i64,
    pub default_preview_mode: usize,
    pub default_record_mode: usize,
}

impl CameraCapabilities {
    /// Dedupe modes and drop anything below the router's usable floor
    /// (fps < 5), then pick defaults per the size/aspect/fps policy.
    pub fn normalize(mut modes: Vec<CapabilityMode>, source: CapabilitySource, timestamp_ms: i64) -> Option<Self> {
        modes.retain(|m| m.fps >= 5.0);
        modes.dedup_by(|a, b| a.width == b.width && a.height == b.height && a.pixel_format == b.pixel_format);
        if modes.is_empty() {
            return None;
        }

        let record_idx = modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.fps <= 30.5)
            .max_by(|(_, a), (_, b)| {
                let a_key = (a.is_16_9(), a.area());
                let b_key = (b.is_16_9(), b.area());
                a_key.cmp(&b_key)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let record_mode = &modes[record_idx];

        let preview_idx = modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.fps >= 15.0)
            .min_by(|(_, a), (_, b)| {
                let a_small = a.area() <= 640 * 480;
                let b_small = b.area() <= 640 * 480;
                let a_aspect = ((a.width as f64 / a.height.max(1) as f64) - (record_mode.width as f64 / record_mode.height.max(1) as f64)).abs();
                let b_aspect = ((b.width as f64 / b.height.max(1) as f64) - (record_mode.width as f64 / record_mode.height.max(1) as f64)).abs();
                (!a_small, a_aspect)
                    .partial_cmp(&(!b_small, b_aspect))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(record_idx);

        Some(Self {
            modes,
            source,
            timestamp_ms,
            default_preview_mode: preview_idx,
            default_record_mode: record_idx,
        })
    }
}

/// A chosen mode plus decimation/overlay policy for one sink.
#[derive(Debug, Clone)]
pub struct ModeSelection {
    pub mode: CapabilityMode,
    pub target_fps: Option<f64>,
    pub keep_every: Option<u32>,
    pub overlay: bool,
    pub color_convert: bool,
}

impl ModeSelection {
    pub fn new(mode: CapabilityMode) -> Self {
        Self {
            mode,
            target_fps: None,
            keep_every: None,
            overlay: false,
            color_convert: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectedConfigs {
    pub preview: ModeSelection,
    pub record: ModeSelection,
    pub storage_profile: String,
}

/// One decoded frame in flight between backend, router, and pipelines.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub frame_number: u64,
    pub monotonic_ns: i64,
    pub sensor_timestamp_ns: Option<i64>,
    pub wall_time_unix: f64,
    pub wait_ms: f32,
    pub color_format: ColorFormat,
    pub storage_queue_drops: u32,
}
