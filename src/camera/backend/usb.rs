// SPDX-License-Identifier: GPL-3.0-only

//! USB UVC capture backend.
//!
//! Discovery walks `/sys/class/video4linux/videoN/device` to find each
//! node's USB root so multiplexed interface nodes (e.g. a UVC camera
//! exposing both a capture and a metadata node) dedupe to one `CameraId`.
//! Grounded on the sysfs walk in `v4l2_utils.rs::find_v4l2_device_for_libcamera`
//! and the dedupe/stable-id policy in `discovery/usb.py`.

use super::{CaptureBackend, CaptureHandle};
use crate::camera::types::{BackendKind, CameraCapabilities, CameraId, CapabilityMode, CapabilitySource, ColorFormat, Frame};
use crate::errors::{BackendError, BackendResult};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const VIDIOC_QUERYCAP: libc::c_ulong = 0x80685600;

#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

fn query_v4l2_cap(fd: i32) -> Option<V4l2Capability> {
    let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::ioctl(fd, VIDIOC_QUERYCAP as _, &mut cap as *mut V4l2Capability) };
    if result < 0 { None } else { Some(cap) }
}

/// Resolves `/sys/class/video4linux/videoN/device` to its USB root path, or
/// `None` if the device isn't USB-backed.
fn device_root(video_index: &str) -> Option<PathBuf> {
    let link = format!("/sys/class/video4linux/{video_index}/device");
    let resolved = std::fs::canonicalize(&link).ok()?;
    if !resolved.components().any(|c| c.as_os_str() == "usb") {
        return None;
    }
    // Interface nodes look like ".../1-2/1-2:1.0"; trim to the device root "1-2".
    let mut root = resolved.clone();
    if let Some(name) = root.file_name().and_then(|n| n.to_str())
        && name.contains(':')
    {
        root.pop();
    }
    Some(root)
}

/// `"{bus}-{port}"` derived from the USB device root's directory name, which
/// is already in that form for a top-level USB device (e.g. `"1-2"`).
fn stable_usb_id(device_root: &Path) -> Option<String> {
    let name = device_root.file_name()?.to_str()?;
    if name.starts_with("usb") {
        return None;
    }
    Some(name.to_string())
}

fn read_sysfs_name(device_root: &Path) -> Option<String> {
    std::fs::read_to_string(device_root.join("product"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Enumerates `/dev/video*`, keeping only USB-backed nodes and deduping by
/// USB root so a camera with multiple interface nodes counts once.
pub fn discover_usb_cameras() -> Vec<CameraId> {
    let mut seen_roots: HashMap<PathBuf, CameraId> = HashMap::new();
    let entries = match std::fs::read_dir("/sys/class/video4linux") {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "usb discovery: cannot list /sys/class/video4linux");
            return Vec::new();
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else { continue };
        if !name_str.starts_with("video") {
            continue;
        }
        let Some(root) = device_root(name_str) else { continue };
        if seen_roots.contains_key(&root) {
            continue;
        }
        let Some(stable_id) = stable_usb_id(&root) else { continue };

        let dev_path = format!("/dev/{name_str}");
        let Ok(file) = std::fs::File::open(&dev_path) else { continue };
        let Some(cap) = query_v4l2_cap(file.as_raw_fd()) else { continue };
        let caps = if cap.device_caps != 0 { cap.device_caps } else { cap.capabilities };
        const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
        if caps & V4L2_CAP_VIDEO_CAPTURE == 0 {
            continue;
        }

        let friendly_name = read_sysfs_name(&root);
        let id = CameraId {
            backend: BackendKind::Usb,
            stable_id,
            dev_path: Some(dev_path),
            friendly_name,
        };
        seen_roots.insert(root, id);
    }

    seen_roots.into_values().collect()
}

pub struct UsbBackend;

impl CaptureBackend for UsbBackend {
    fn probe(&self, location: &str) -> BackendResult<Option<CameraCapabilities>> {
        let device = v4l::Device::with_path(location)
            .map_err(|e| BackendError::DeviceNotFound(format!("{location}: {e}")))?;
        let format_descs = device
            .enum_formats()
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let mut modes = Vec::new();
        for desc in &format_descs {
            let Ok(frame_sizes) = device.enum_framesizes(desc.fourcc) else { continue };
            for size in frame_sizes {
                for discrete in size.size.to_discrete() {
                    let fps = device
                        .enum_frameintervals(desc.fourcc, discrete.width, discrete.height)
                        .ok()
                        .and_then(|intervals| intervals.into_iter().filter_map(|i| i.interval.to_fps()).reduce(f64::max))
                        .unwrap_or(30.0);
                    modes.push(CapabilityMode {
                        width: discrete.width,
                        height: discrete.height,
                        fps,
                        pixel_format: desc.fourcc.str().unwrap_or("MJPG").to_string(),
                        controls: HashMap::new(),
                    });
                }
            }
        }

        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        Ok(CameraCapabilities::normalize(modes, CapabilitySource::Probe, now_ms))
    }

    fn open(&self, location: &str, mode: &CapabilityMode) -> BackendResult<CaptureHandle> {
        let location = location.to_string();
        let mode = mode.clone();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(4);

        let worker_stop = stop_flag.clone();
        std::thread::Builder::new()
            .name(format!("uvc-capture-{location}"))
            .spawn(move || usb_capture_loop(&location, &mode, worker_stop, tx))
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        Ok(CaptureHandle::from_channel(rx, stop_flag))
    }
}

fn usb_capture_loop(
    location: &str,
    mode: &CapabilityMode,
    stop_flag: Arc<AtomicBool>,
    tx: mpsc::Sender<BackendResult<Frame>>,
) {
    let fmt = v4l::Format::new(mode.width, mode.height, v4l::FourCC::new(mode.pixel_format.as_bytes()));
    let mut device = match v4l::prelude::Device::with_path(location) {
        Ok(d) => d,
        Err(e) => {
            let _ = tx.blocking_send(Err(BackendError::DeviceNotFound(e.to_string())));
            return;
        }
    };
    if let Err(e) = device.set_format(&fmt) {
        let _ = tx.blocking_send(Err(BackendError::FormatNotSupported(e.to_string())));
        return;
    }

    let mut stream = match v4l::io::mmap::Stream::with_buffers(&mut device, v4l::buffer::Type::VideoCapture, 4) {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.blocking_send(Err(BackendError::InitializationFailed(e.to_string())));
            return;
        }
    };

    let frame_counter = AtomicU64::new(0);
    while !stop_flag.load(Ordering::SeqCst) {
        let (data, _meta) = match v4l::io::traits::CaptureStream::next(&mut stream) {
            Ok(buf) => buf,
            Err(e) => {
                error!(location, error = %e, "uvc: device lost");
                let _ = tx.blocking_send(Err(BackendError::DeviceLost(e.to_string())));
                break;
            }
        };

        let frame_number = frame_counter.fetch_add(1, Ordering::SeqCst);
        let wall_time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let frame = Frame {
            data: data.to_vec(),
            frame_number,
            monotonic_ns: monotonic_ns(),
            sensor_timestamp_ns: None,
            wall_time_unix: wall_time,
            wait_ms: 0.0,
            color_format: ColorFormat::Rgb,
            storage_queue_drops: 0,
        };

        if tx.blocking_send(Ok(frame)).is_err() {
            debug!(location, "uvc: receiver dropped, stopping capture thread");
            break;
        }
    }
}

fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_usb_id_extracts_bus_port() {
        assert_eq!(stable_usb_id(Path::new("/sys/devices/pci0000:00/usb1/1-2")), Some("1-2".to_string()));
        assert_eq!(stable_usb_id(Path::new("/sys/devices/pci0000:00/usb1")), None);
    }
}
