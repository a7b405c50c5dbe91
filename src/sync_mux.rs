// SPDX-License-Identifier: GPL-3.0-only

//! Sync & Mux: resolves a trial's recorded files, extracts timing from their
//! CSVs, writes a sync metadata document, and invokes an external A/V muxer
//! per camera. Grounded directly on `original_source/utils/sync_and_mux.py`
//! (`find_trial_files`, `extract_timing_from_csv`, `generate_sync_metadata`,
//! `process_trial`), generalized from a standalone script into a library
//! module callable from its own CLI or from the supervisor after
//! `stop_trial`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const MP4_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const MP4_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MP4_STABLE_POLLS_REQUIRED: u32 = 3;

#[derive(Debug, Default)]
pub struct TrialFiles {
    pub audio: Option<PathBuf>,
    pub audio_csv: Option<PathBuf>,
    pub videos: Vec<(u32, PathBuf)>,
    pub video_csvs: BTreeMap<u32, PathBuf>,
    pub session_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSyncData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_csv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_unix: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_timestamp_ns: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub trial_number: u32,
    pub session_timestamp: Option<String>,
    pub modules: BTreeMap<String, ModuleSyncData>,
}

/// Scans `session_dir` for this trial's audio/video/timing files. If a video
/// is still `.h264`, polls up to 60s for `.mp4` materialization (three
/// successive 500ms polls with stable file sizes).
pub async fn find_trial_files(session_dir: &Path, trial_number: u32) -> std::io::Result<TrialFiles> {
    let mut files = TrialFiles::default();
    let pattern = format!("trial{trial_number:03}");

    let entries = list_entries(session_dir)?;
    files.audio = entries.iter().find(|p| name_contains(p, &pattern) && has_ext(p, "wav")).cloned();

    let mut video_files: Vec<PathBuf> = entries.iter().filter(|p| name_contains(p, &pattern) && has_ext(p, "mp4")).cloned().collect();

    if video_files.is_empty() {
        let h264_files: Vec<PathBuf> = entries.iter().filter(|p| name_contains(p, &pattern) && has_ext(p, "h264")).cloned().collect();
        if !h264_files.is_empty() {
            info!(count = h264_files.len(), "waiting for mp4 conversion");
            video_files = wait_for_mp4_materialization(session_dir, &pattern, h264_files.len()).await;
            if video_files.is_empty() {
                warn!(trial = trial_number, "mp4 conversion incomplete after timeout, using h264 files");
                video_files = h264_files;
            }
        }
    }

    for video_file in &video_files {
        if let Some(cam_id) = extract_cam_id(video_file) {
            files.videos.push((cam_id, video_file.clone()));
        }
    }
    files.videos.sort_by_key(|(id, _)| *id);

    files.audio_csv = entries
        .iter()
        .find(|p| name_contains(p, "AUDIOTIMING") && name_contains(p, &pattern) && has_ext(p, "csv"))
        .cloned();

    for entry in entries.iter().filter(|p| name_contains(p, "CAMTIMING") && name_contains(p, &pattern) && has_ext(p, "csv")) {
        if let Some(cam_id) = extract_cam_id(entry) {
            files.video_csvs.insert(cam_id, entry.clone());
        }
    }

    if let Some(name) = session_dir.file_name().map(|n| n.to_string_lossy().to_string())
        && let Some((_, rest)) = name.split_once('_')
    {
        files.session_timestamp = Some(rest.to_string());
    }

    Ok(files)
}

fn list_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        out.push(entry?.path());
    }
    Ok(out)
}

fn name_contains(path: &Path, needle: &str) -> bool {
    path.file_name().map(|n| n.to_string_lossy().contains(needle)).unwrap_or(false)
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case(ext)).unwrap_or(false)
}

fn extract_cam_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let idx = name.find("CAM")?;
    let digits: String = name[idx + 3..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

async fn wait_for_mp4_materialization(session_dir: &Path, pattern: &str, expected_count: usize) -> Vec<PathBuf> {
    let start = tokio::time::Instant::now();
    let mut stable_count = 0u32;
    let mut last_sizes: BTreeMap<PathBuf, u64> = BTreeMap::new();

    while start.elapsed() < MP4_WAIT_TIMEOUT {
        tokio::time::sleep(MP4_POLL_INTERVAL).await;
        let entries = list_entries(session_dir).unwrap_or_default();
        let video_files: Vec<PathBuf> = entries.into_iter().filter(|p| name_contains(p, pattern) && has_ext(p, "mp4")).collect();

        if video_files.len() >= expected_count {
            let current_sizes: BTreeMap<PathBuf, u64> =
                video_files.iter().filter_map(|f| std::fs::metadata(f).ok().map(|m| (f.clone(), m.len()))).collect();

            if current_sizes == last_sizes && !current_sizes.is_empty() {
                stable_count += 1;
                if stable_count >= MP4_STABLE_POLLS_REQUIRED {
                    info!(elapsed_s = start.elapsed().as_secs_f64(), count = video_files.len(), "mp4 conversion complete");
                    return video_files;
                }
            } else {
                stable_count = 0;
                last_sizes = current_sizes;
            }
        }
    }
    Vec::new()
}

/// Reads the header and first data row of a timing CSV, extracting
/// `write_time_unix` and (for camera CSVs) `sensor_timestamp_ns`.
pub fn extract_timing_from_csv(csv_path: &Path, module_type: &str) -> std::io::Result<Option<(f64, Option<i64>, Option<u64>)>> {
    let contents = std::fs::read_to_string(csv_path)?;
    let mut lines = contents.lines();
    lines.next(); // header
    let Some(first_data) = lines.next() else {
        return Ok(None);
    };
    let fields: Vec<&str> = first_data.trim().split(',').collect();

    match module_type {
        "audio" => {
            // trial,chunk_num,write_time_unix,frames_in_chunk,total_frames
            if fields.len() < 4 {
                return Ok(None);
            }
            let write_time: f64 = fields[2].parse().unwrap_or(0.0);
            let frames_in_chunk: u64 = fields[3].parse().unwrap_or(0);
            Ok(Some((write_time, None, Some(frames_in_chunk))))
        }
        "camera" => {
            // trial,frame_number,write_time_unix,monotonic_time,sensor_timestamp_ns,...
            if fields.len() < 5 {
                return Ok(None);
            }
            let write_time: f64 = fields[2].parse().unwrap_or(0.0);
            let sensor_ts = if fields[4].is_empty() { None } else { fields[4].parse::<i64>().ok() };
            Ok(Some((write_time, sensor_ts, None)))
        }
        _ => Ok(None),
    }
}

/// Builds the sync metadata document for one trial from the files resolved
/// by `find_trial_files`.
pub async fn generate_sync_metadata(session_dir: &Path, trial_number: u32) -> std::io::Result<SyncMetadata> {
    let files = find_trial_files(session_dir, trial_number).await?;
    let mut modules = BTreeMap::new();

    if let Some(audio) = &files.audio {
        let mut data = ModuleSyncData {
            device_id: Some(0),
            audio_file: Some(audio.to_string_lossy().to_string()),
            ..Default::default()
        };
        if let Some(csv) = &files.audio_csv {
            data.timing_csv = Some(csv.to_string_lossy().to_string());
            match extract_timing_from_csv(csv, "audio") {
                Ok(Some((start, _, frames))) => {
                    data.start_time_unix = Some(start);
                    data.first_chunk_frames = frames;
                }
                Ok(None) => warn!(trial = trial_number, "audio timing csv had no data row"),
                Err(e) => error!(trial = trial_number, error = %e, "failed to read audio timing csv"),
            }
        } else {
            warn!(trial = trial_number, "audio timing csv not found, sync metadata will be incomplete");
        }
        modules.insert("AudioRecorder_0".to_string(), data);
    }

    for (cam_id, video_file) in &files.videos {
        let mut data = ModuleSyncData {
            camera_id: Some(*cam_id),
            video_file: Some(video_file.to_string_lossy().to_string()),
            ..Default::default()
        };
        if let Some(csv) = files.video_csvs.get(cam_id) {
            data.timing_csv = Some(csv.to_string_lossy().to_string());
            match extract_timing_from_csv(csv, "camera") {
                Ok(Some((start, sensor_ts, _))) => {
                    data.start_time_unix = Some(start);
                    data.sensor_timestamp_ns = sensor_ts;
                }
                Ok(None) => warn!(trial = trial_number, camera = cam_id, "camera timing csv had no data row"),
                Err(e) => error!(trial = trial_number, camera = cam_id, error = %e, "failed to read camera timing csv"),
            }
        } else {
            warn!(trial = trial_number, camera = cam_id, "camera timing csv not found, sync metadata will be incomplete");
        }
        modules.insert(format!("Camera_{cam_id}"), data);
    }

    Ok(SyncMetadata {
        trial_number,
        session_timestamp: files.session_timestamp,
        modules,
    })
}

fn sync_file_name(session_timestamp: &str, trial_number: u32) -> String {
    format!("{session_timestamp}_SYNC_trial{trial_number:03}.json")
}

/// Writes the sync metadata JSON document and, for every camera with a
/// matching audio track, invokes the external muxer with the computed
/// `video.start - audio.start` offset.
pub async fn process_trial(session_dir: &Path, trial_number: u32, mux: bool) -> std::io::Result<()> {
    info!(trial = trial_number, dir = %session_dir.display(), "processing trial");
    let metadata = generate_sync_metadata(session_dir, trial_number).await?;

    if metadata.modules.is_empty() {
        warn!(trial = trial_number, "no data found for trial, skipping");
        return Ok(());
    }

    let session_timestamp = metadata.session_timestamp.clone().unwrap_or_else(|| "session".to_string());
    let sync_path = session_dir.join(sync_file_name(&session_timestamp, trial_number));
    let body = serde_json::to_vec_pretty(&metadata)?;
    tokio::fs::write(&sync_path, body).await?;
    info!(path = %sync_path.display(), "wrote sync metadata");

    if !mux {
        return Ok(());
    }

    let Some(audio) = metadata.modules.get("AudioRecorder_0") else {
        info!(trial = trial_number, "no audio file found for muxing");
        return Ok(());
    };

    let camera_modules: Vec<(&String, &ModuleSyncData)> = metadata.modules.iter().filter(|(k, _)| k.starts_with("Camera_")).collect();
    if camera_modules.is_empty() {
        info!(trial = trial_number, "no camera files found for muxing");
        return Ok(());
    }

    let mut success = 0usize;
    for (key, cam_data) in &camera_modules {
        let cam_id = cam_data.camera_id.unwrap_or(0);
        let Some(video_file) = &cam_data.video_file else {
            warn!(camera = %key, "no video file, skipping mux");
            continue;
        };

        let offset = match (cam_data.start_time_unix, audio.start_time_unix) {
            (Some(v), Some(a)) => v - a,
            _ => {
                warn!(camera = cam_id, "missing timing data, muxing with zero offset (no sync)");
                0.0
            }
        };

        let output_name = format!("{session_timestamp}_AV_CAM{cam_id}_trial{trial_number:03}.mp4");
        let output_path = session_dir.join(&output_name);

        match mux_audio_video(Path::new(&audio.audio_file.clone().unwrap_or_default()), Path::new(video_file), &output_path, offset).await {
            Ok(()) => {
                info!(camera = cam_id, output = %output_name, "muxed audio/video");
                success += 1;
            }
            Err(e) => error!(camera = cam_id, error = %e, "failed to mux audio/video"),
        }
    }
    info!(muxed = success, total = camera_modules.len(), trial = trial_number, "mux pass complete");
    Ok(())
}

/// Invokes `ffmpeg` to combine `video` and `audio` into `output`, shifting
/// the audio stream by `offset_seconds` (`video.start - audio.start`).
/// Muxing errors for one camera never affect other cameras or trials.
async fn mux_audio_video(audio: &Path, video: &Path, output: &Path, offset_seconds: f64) -> std::io::Result<()> {
    let itsoffset = format!("{offset_seconds:.6}");
    let status = tokio::process::Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(video)
        .args(["-itsoffset", &itsoffset, "-i"])
        .arg(audio)
        .args(["-c:v", "copy", "-c:a", "aac", "-shortest"])
        .arg(output)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;

    if !status.success() {
        return Err(std::io::Error::other(format!("ffmpeg exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_cam_id_reads_digits_after_cam() {
        let path = PathBuf::from("20260101_CAM_trial001_CAM2_1280x720_30.mp4");
        assert_eq!(extract_cam_id(&path), Some(2));
    }

    #[test]
    fn extract_timing_from_csv_reads_camera_row() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("timing.csv");
        std::fs::write(&path, "trial,frame_number,write_time_unix,monotonic_time,sensor_timestamp_ns,hardware_frame_number,dropped_since_last,total_hardware_drops,storage_queue_drops\n1,0,1700000000.5,0.0,123456789,0,0,0,0\n")?;
        let (start, sensor_ts, _) = extract_timing_from_csv(&path, "camera")?.unwrap();
        assert_eq!(start, 1700000000.5);
        assert_eq!(sensor_ts, Some(123456789));
        Ok(())
    }

    #[test]
    fn extract_timing_from_csv_handles_empty_sensor_timestamp() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("timing.csv");
        std::fs::write(&path, "header\n1,0,1700000000.0,0.0,,0,0,0,0\n")?;
        let (_, sensor_ts, _) = extract_timing_from_csv(&path, "camera")?.unwrap();
        assert_eq!(sensor_ts, None);
        Ok(())
    }

    #[tokio::test]
    async fn generate_sync_metadata_computes_zero_offset_when_timing_missing() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let session_dir = dir.path().join("study_20260101_120000");
        std::fs::create_dir_all(&session_dir)?;
        std::fs::write(session_dir.join("20260101_120000_CAM_trial001_CAM0_640x480_30.mp4"), b"fake")?;

        let metadata = generate_sync_metadata(&session_dir, 1).await?;
        let cam = metadata.modules.get("Camera_0").expect("camera entry present");
        assert!(cam.start_time_unix.is_none());
        Ok(())
    }
}
