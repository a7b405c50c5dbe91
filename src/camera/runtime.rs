// SPDX-License-Identifier: GPL-3.0-only

//! Camera Runtime: orchestrates discovery -> probe -> open -> router attach
//! -> preview -> (on record) record pipeline, and safe reconfiguration.
//! Grounded on `backends/camera/manager.rs`'s `CameraBackendManager`,
//! generalized from a single active camera to a map of concurrently open
//! cameras.

use crate::camera::backend::csi::{discover_csi_cameras, CsiBackend};
use crate::camera::backend::usb::{discover_usb_cameras, UsbBackend};
use crate::camera::backend::CaptureBackend;
use crate::camera::preview::PreviewPipeline;
use crate::camera::record::{RecordPipeline, RecordPipelinePaths};
use crate::camera::router::Router;
use crate::camera::types::{CameraCapabilities, CameraId, CapabilityMode, Frame, ModeSelection};
use crate::errors::{AppError, AppResult};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Absent,
    Opening,
    Ready,
    Reconfiguring,
    Recording,
    Closing,
}

struct OpenCamera {
    state: CameraState,
    router: Router,
    preview: PreviewPipeline,
    record: Option<RecordPipeline>,
    record_rx: Option<tokio::sync::mpsc::Receiver<Option<Frame>>>,
    selection: CameraSelection,
    mode: CapabilityMode,
    active_recording: Option<ActiveRecording>,
}

/// The trial context of an in-progress recording, kept so a safe reconfigure
/// mid-recording can restart the record pipeline against the new mode.
#[derive(Clone)]
struct ActiveRecording {
    session_dir: std::path::PathBuf,
    trial_number: u32,
    timestamp: String,
}

#[derive(Clone)]
struct CameraSelection {
    preview_target_fps: Option<f64>,
    preview_keep_every: Option<u32>,
    record_overlay: bool,
}

impl Default for CameraSelection {
    fn default() -> Self {
        Self {
            preview_target_fps: Some(2.0),
            preview_keep_every: None,
            record_overlay: false,
        }
    }
}

fn backend_for(id: &CameraId) -> Box<dyn CaptureBackend> {
    match id.backend {
        crate::camera::types::BackendKind::Usb => Box::new(UsbBackend),
        crate::camera::types::BackendKind::Csi => Box::new(CsiBackend),
    }
}

/// Parses a `"WxH"` resolution string, case-insensitive on the separator.
fn parse_wxh(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Picks the probed mode closest to the requested (width, height, fps),
/// preferring the smallest total dimension delta and breaking ties on fps.
fn select_mode(capabilities: &CameraCapabilities, width: u32, height: u32, fps: f64) -> CapabilityMode {
    capabilities
        .modes
        .iter()
        .min_by(|a, b| {
            let score = |m: &CapabilityMode| {
                let dim_delta = (m.width as i64 - width as i64).unsigned_abs() + (m.height as i64 - height as i64).unsigned_abs();
                (dim_delta, (m.fps - fps).abs())
            };
            score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .unwrap_or_else(|| capabilities.modes[capabilities.default_record_mode].clone())
}

/// The mandatory 8-step safe-reconfigure sequence (spec §4.I): tear down
/// record, preview, router, and backend in that order, reopen with the new
/// mode, then rebuild the pipeline stack and resume recording if it had been
/// active before the reconfigure started.
async fn reconfigure_locked(camera: &mut OpenCamera, id: &CameraId, new_mode: CapabilityMode) -> AppResult<()> {
    let key = id.key();
    let was_recording = camera.active_recording.clone();
    camera.state = CameraState::Reconfiguring;

    // 1. stop record pipeline if active
    if let Some(record) = camera.record.take() {
        camera.router.set_record_enabled(false).await;
        record.stop().await;
    }
    // 2. stop preview pipeline
    camera.preview.stop();
    // 3 & 4. stop router (its consumer task stops the backend handle on exit)
    camera.router.stop().await;

    // 5. reopen backend with the new mode
    let backend = backend_for(id);
    let location = id.dev_path.clone().unwrap_or_else(|| id.stable_id.clone());
    let handle = backend.open(&location, &new_mode)?;

    // 6. re-attach router with fresh queues
    let mode_selection = ModeSelection {
        mode: new_mode.clone(),
        target_fps: camera.selection.preview_target_fps,
        keep_every: camera.selection.preview_keep_every,
        overlay: camera.selection.record_overlay,
        color_convert: true,
    };
    let (router, queues) = Router::attach(handle, mode_selection, 4, 64, true, false);

    // 7. restart preview
    let preview = PreviewPipeline::start(
        queues.preview_ring,
        camera.selection.preview_target_fps,
        camera.selection.preview_keep_every,
        move |_frame: Frame| {},
    );

    camera.router = router;
    camera.preview = preview;
    camera.record_rx = Some(queues.record_rx);
    camera.mode = new_mode;

    // 8. if recording was active, restart it against the new mode
    if let Some(ctx) = was_recording {
        let paths = crate::session::resolve_trial_paths(
            &ctx.session_dir,
            &key,
            ctx.trial_number,
            camera.mode.width,
            camera.mode.height,
            camera.mode.fps,
            &ctx.timestamp,
        );
        crate::session::create_trial_dirs(&paths)?;

        let record_rx = camera.record_rx.take().expect("record_rx just populated by reattach");
        camera.router.set_record_enabled(true).await;

        let selection = ModeSelection {
            mode: camera.mode.clone(),
            target_fps: None,
            keep_every: None,
            overlay: camera.selection.record_overlay,
            color_convert: true,
        };
        let record = RecordPipeline::start(
            record_rx,
            selection,
            RecordPipelinePaths {
                video_path: paths.video_path,
                timing_path: paths.timing_path,
                metadata_path: paths.metadata_path,
            },
            Some(ctx.trial_number),
        )
        .await?;

        camera.record = Some(record);
        camera.active_recording = Some(ctx);
        camera.state = CameraState::Recording;
    } else {
        camera.state = CameraState::Ready;
    }

    info!(camera = %key, width = camera.mode.width, height = camera.mode.height, fps = camera.mode.fps, "camera reconfigured");
    Ok(())
}

/// Owns every currently-open camera for this process.
pub struct CameraRuntime {
    cameras: Mutex<HashMap<String, OpenCamera>>,
    active_preview_key: Mutex<Option<String>>,
}

impl Default for CameraRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraRuntime {
    pub fn new() -> Self {
        Self {
            cameras: Mutex::new(HashMap::new()),
            active_preview_key: Mutex::new(None),
        }
    }

    /// Merges USB and CSI discovery lists, resolving key collisions in
    /// favor of CSI (a CSI sensor enumerated under a USB-style key is
    /// unusual but CSI identity is considered authoritative when it occurs).
    pub fn discover_all(&self) -> Vec<CameraId> {
        let mut by_key: HashMap<String, CameraId> = HashMap::new();
        for id in discover_usb_cameras() {
            by_key.insert(id.key(), id);
        }
        for id in discover_csi_cameras() {
            by_key.insert(id.key(), id);
        }
        by_key.into_values().collect()
    }

    pub fn probe(&self, id: &CameraId) -> AppResult<Option<CameraCapabilities>> {
        let backend = backend_for(id);
        let location = id.dev_path.clone().unwrap_or_else(|| id.stable_id.clone());
        Ok(backend.probe(&location)?)
    }

    /// Idempotent open: does nothing if the camera is already tracked.
    /// Selects default modes, starts the router and preview pipeline with
    /// a conservative default preview rate (~2 FPS) to bound CPU usage.
    pub async fn ensure_camera(&self, id: &CameraId) -> AppResult<()> {
        let key = id.key();
        if self.cameras.lock().await.contains_key(&key) {
            return Ok(());
        }

        let capabilities = self.probe(id)?.ok_or_else(|| AppError::DeviceNotFound(key.clone()))?;
        let record_mode = capabilities.modes[capabilities.default_record_mode].clone();
        let preview_mode = capabilities.modes[capabilities.default_preview_mode].clone();

        let backend = backend_for(id);
        let location = id.dev_path.clone().unwrap_or_else(|| id.stable_id.clone());
        let handle = backend.open(&location, &record_mode)?;

        let selection = CameraSelection::default();
        let mode_selection = ModeSelection {
            mode: preview_mode,
            target_fps: selection.preview_target_fps,
            keep_every: selection.preview_keep_every,
            overlay: false,
            color_convert: true,
        };

        let (router, queues) = Router::attach(handle, mode_selection, 4, 64, true, false);
        let preview = PreviewPipeline::start(
            queues.preview_ring,
            selection.preview_target_fps,
            selection.preview_keep_every,
            move |_frame: Frame| {
                // UI sink wiring happens at a higher layer (module process);
                // the runtime only guarantees delivery up to this callback.
            },
        );

        // The record receiver stays parked here, unused, until a trial
        // starts and `start_recording` hands it to a `RecordPipeline`. The
        // router only feeds it once record is enabled, so nothing backs up
        // in the meantime.
        self.cameras.lock().await.insert(
            key.clone(),
            OpenCamera {
                state: CameraState::Ready,
                router,
                preview,
                record: None,
                record_rx: Some(queues.record_rx),
                selection,
                mode: record_mode,
                active_recording: None,
            },
        );
        info!(camera = %key, "camera opened and ready");
        Ok(())
    }

    /// Parses and applies live settings. Pure decimation changes
    /// (`preview_fps` keep-every/target-fps form) update live; a change to
    /// `preview_resolution`, `record_resolution`, or `record_fps` that
    /// actually moves the camera's capture mode signature triggers the
    /// mandatory safe-reconfigure sequence (spec §4.I).
    pub async fn apply_camera_config(&self, id: &CameraId, settings: &HashMap<String, String>) -> AppResult<()> {
        let key = id.key();
        let mut cameras = self.cameras.lock().await;
        let camera = cameras.get_mut(&key).ok_or_else(|| AppError::DeviceNotFound(key.clone()))?;

        if let Some(preview_fps) = settings.get("preview_fps") {
            if let Some(pct) = preview_fps.strip_suffix('%') {
                if let Ok(pct_value) = pct.parse::<f64>()
                    && pct_value > 0.0
                {
                    let keep_every = (100.0 / pct_value).round().max(1.0) as u32;
                    camera.preview.set_keep_every(Some(keep_every)).await;
                    camera.selection.preview_keep_every = Some(keep_every);
                }
            } else if let Ok(fps) = preview_fps.parse::<f64>() {
                camera.preview.set_target_fps(Some(fps)).await;
                camera.selection.preview_target_fps = Some(fps);
            }
        }

        let requested_resolution = settings
            .get("record_resolution")
            .or_else(|| settings.get("preview_resolution"))
            .and_then(|s| parse_wxh(s));
        let requested_fps = settings.get("record_fps").and_then(|s| s.parse::<f64>().ok());

        if requested_resolution.is_none() && requested_fps.is_none() {
            return Ok(());
        }

        let (width, height) = requested_resolution.unwrap_or((camera.mode.width, camera.mode.height));
        let fps = requested_fps.unwrap_or(camera.mode.fps);

        if width == camera.mode.width && height == camera.mode.height && (fps - camera.mode.fps).abs() < 0.01 {
            return Ok(()); // no actual signature change, nothing to reconfigure
        }

        let capabilities = self.probe(id)?.ok_or_else(|| AppError::DeviceNotFound(key.clone()))?;
        let new_mode = select_mode(&capabilities, width, height, fps);

        if new_mode == camera.mode {
            return Ok(());
        }

        reconfigure_locked(camera, id, new_mode).await
    }

    /// Starts a record pipeline for an already-open camera by attaching a
    /// fresh record queue from the router (the router was created with
    /// record disabled by default).
    pub async fn start_recording(
        &self,
        id: &CameraId,
        session_dir: &std::path::Path,
        trial_number: u32,
        timestamp: &str,
    ) -> AppResult<()> {
        let key = id.key();
        let mut cameras = self.cameras.lock().await;
        let camera = cameras.get_mut(&key).ok_or_else(|| AppError::DeviceNotFound(key.clone()))?;

        if camera.record.is_some() {
            return Err(AppError::StateTransitionError(format!("{key} already recording")));
        }

        let paths = crate::session::resolve_trial_paths(session_dir, &key, trial_number, camera.mode.width, camera.mode.height, camera.mode.fps, timestamp);
        crate::session::create_trial_dirs(&paths)?;

        let record_rx = match camera.record_rx.take() {
            Some(rx) => rx,
            None => camera.router.reattach_record_channel(64).await,
        };
        camera.router.set_record_enabled(true).await;

        let selection = ModeSelection {
            mode: camera.mode.clone(),
            target_fps: None,
            keep_every: None,
            overlay: camera.selection.record_overlay,
            color_convert: true,
        };

        let record = RecordPipeline::start(
            record_rx,
            selection,
            RecordPipelinePaths {
                video_path: paths.video_path,
                timing_path: paths.timing_path,
                metadata_path: paths.metadata_path,
            },
            Some(trial_number),
        )
        .await?;

        camera.record = Some(record);
        camera.state = CameraState::Recording;
        camera.active_recording = Some(ActiveRecording {
            session_dir: session_dir.to_path_buf(),
            trial_number,
            timestamp: timestamp.to_string(),
        });
        Ok(())
    }

    pub async fn stop_recording(&self, id: &CameraId) -> AppResult<()> {
        let key = id.key();
        let mut cameras = self.cameras.lock().await;
        let camera = cameras.get_mut(&key).ok_or_else(|| AppError::DeviceNotFound(key.clone()))?;

        if let Some(record) = camera.record.take() {
            camera.router.set_record_enabled(false).await;
            record.stop().await;
            camera.state = CameraState::Ready;
            camera.active_recording = None;
        }
        Ok(())
    }

    pub async fn teardown_camera(&self, id: &CameraId) -> AppResult<()> {
        let key = id.key();
        let mut cameras = self.cameras.lock().await;
        if let Some(mut camera) = cameras.remove(&key) {
            camera.state = CameraState::Closing;
            if let Some(record) = camera.record.take() {
                record.stop().await;
            }
            camera.preview.stop();
            camera.router.stop().await;
            info!(camera = %key, "camera torn down");
        }
        Ok(())
    }

    /// Preview is only enabled for the active camera; all others have
    /// preview disabled at the router.
    pub async fn set_active_preview(&self, id: Option<&CameraId>) {
        let mut active = self.active_preview_key.lock().await;
        let new_key = id.map(|i| i.key());
        let cameras = self.cameras.lock().await;
        for (key, camera) in cameras.iter() {
            camera.router.set_preview_enabled(Some(key.clone()) == new_key);
        }
        *active = new_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::CapabilitySource;

    fn mode(width: u32, height: u32, fps: f64) -> CapabilityMode {
        CapabilityMode { width, height, fps, pixel_format: "SBGGR10".to_string(), controls: HashMap::new() }
    }

    fn caps(modes: Vec<CapabilityMode>) -> CameraCapabilities {
        CameraCapabilities::normalize(modes, CapabilitySource::Probe, 0).unwrap()
    }

    #[test]
    fn parse_wxh_accepts_lowercase_and_uppercase_separator() {
        assert_eq!(parse_wxh("1280x720"), Some((1280, 720)));
        assert_eq!(parse_wxh("640X480"), Some((640, 480)));
        assert_eq!(parse_wxh("bogus"), None);
    }

    #[test]
    fn select_mode_prefers_exact_match() {
        let capabilities = caps(vec![mode(640, 480, 30.0), mode(1280, 720, 30.0), mode(1920, 1080, 30.0)]);
        let picked = select_mode(&capabilities, 1280, 720, 30.0);
        assert_eq!((picked.width, picked.height), (1280, 720));
    }

    #[test]
    fn select_mode_falls_back_to_closest_when_no_exact_match() {
        let capabilities = caps(vec![mode(640, 480, 30.0), mode(1920, 1080, 30.0)]);
        let picked = select_mode(&capabilities, 1600, 900, 30.0);
        assert_eq!((picked.width, picked.height), (1920, 1080));
    }
}
