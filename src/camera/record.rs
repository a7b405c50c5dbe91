// SPDX-License-Identifier: GPL-3.0-only

//! Record Pipeline: timestamped encode path with overlay, CSV logging, and
//! an encoder abstraction owning its writer task. Grounded on
//! `record/pipeline.py`'s `RecordPipeline`.

use crate::camera::csv_logger::{CSVLogger, CSVRecord};
use crate::camera::encoder::{swap_rgb_bgr, EncoderConfig, EncoderHandle};
use crate::camera::timing::FrameTimingTracker;
use crate::camera::types::{ColorFormat, Frame, ModeSelection};
use crate::errors::AppResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const FLUSH_EVERY_ROWS: usize = 100;
const FLUSH_INTERVAL_FRAMES: u64 = 600;

pub struct RecordPipelinePaths {
    pub video_path: PathBuf,
    pub timing_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Handle to an active per-camera, per-trial recording.
pub struct RecordPipeline {
    task: JoinHandle<()>,
    sender: mpsc::Sender<Option<Frame>>,
}

impl RecordPipeline {
    pub async fn start(
        mut record_rx: mpsc::Receiver<Option<Frame>>,
        selection: ModeSelection,
        paths: RecordPipelinePaths,
        trial_number: Option<u32>,
    ) -> AppResult<Self> {
        let csv_logger = Arc::new(CSVLogger::new());
        csv_logger.start(&paths.timing_path).await?;

        let encoder_config = EncoderConfig {
            width: selection.mode.width,
            height: selection.mode.height,
            fps: selection.mode.fps,
        };
        let frame_width = encoder_config.width;
        let frame_height = encoder_config.height;
        let encoder = EncoderHandle::start(&paths.video_path, &encoder_config)?;

        let (sender, mut forward_rx) = mpsc::channel::<Option<Frame>>(1);
        // The caller drives frames in through `record_rx`; we re-expose a
        // sender so a `RecordPipelineHandle` can also inject an explicit
        // stop sentinel independent of the router.
        let start_time = chrono::Utc::now();
        let video_path_for_drain = paths.video_path.clone();
        let metadata_path = paths.metadata_path.clone();
        let overlay = selection.overlay;

        let task = tokio::spawn(async move {
            let mut tracker = FrameTimingTracker::new();
            let mut frame_count: u64 = 0;
            let mut encoder = Some(encoder);

            loop {
                let next = tokio::select! {
                    item = record_rx.recv() => item,
                    item = forward_rx.recv() => item,
                };
                let Some(maybe_frame) = next else { break };
                let Some(frame) = maybe_frame else { break };

                let timing = tracker.update(Some(frame.frame_number), frame.sensor_timestamp_ns, frame.monotonic_ns as f64 / 1e9);

                let bgr_data;
                let (data, color_format): (&[u8], ColorFormat) = match frame.color_format {
                    ColorFormat::Rgb => {
                        bgr_data = swap_rgb_bgr(&frame.data);
                        (&bgr_data, ColorFormat::Bgr)
                    }
                    ColorFormat::Bgr => (&frame.data, ColorFormat::Bgr),
                };
                let _ = color_format;

                let overlaid;
                let encode_data: &[u8] = if overlay {
                    overlaid = draw_overlay(data, frame_width, frame_height, frame.frame_number, frame.wall_time_unix);
                    &overlaid
                } else {
                    data
                };

                csv_logger
                    .log_frame(
                        CSVRecord {
                            trial: trial_number,
                            frame_number: frame.frame_number,
                            write_time_unix: frame.wall_time_unix,
                            monotonic_time: frame.monotonic_ns as f64 / 1e9,
                            sensor_timestamp_ns: frame.sensor_timestamp_ns,
                            hardware_frame_number: Some(timing.hardware_frame_number),
                            dropped_since_last: Some(timing.dropped_since_last),
                            total_hardware_drops: timing.total_hardware_drops,
                            storage_queue_drops: frame.storage_queue_drops,
                        },
                        FLUSH_EVERY_ROWS,
                    )
                    .await;

                let pts_source_ns = frame.sensor_timestamp_ns.unwrap_or(frame.monotonic_ns);
                if let Some(enc) = encoder.as_ref()
                    && let Err(e) = enc.enqueue(encode_data, pts_source_ns)
                {
                    error!(error = %e, "record pipeline: encoder enqueue failed, stopping this camera's recording");
                    break;
                }

                frame_count += 1;
                if frame_count.is_multiple_of(FLUSH_INTERVAL_FRAMES) {
                    if let Some(enc) = encoder.as_ref() {
                        enc.checkpoint(&video_path_for_drain);
                    }
                    csv_logger.flush().await;
                }
            }

            csv_logger.stop().await;
            if let Some(enc) = encoder.take() {
                enc.stop();
            }

            write_metadata(&metadata_path, start_time, frame_count).await;
            info!(frames = frame_count, "record pipeline stopped");
        });

        Ok(Self { task, sender })
    }

    /// Requests a graceful stop by pushing a sentinel; the pipeline task
    /// drains and finishes on its own.
    pub async fn stop(self) {
        let _ = self.sender.send(None).await;
        let _ = self.task.await;
    }
}

#[derive(Debug, serde::Serialize)]
struct RecordingMetadata {
    start_time_unix: f64,
    end_time_unix: Option<f64>,
    frame_count: u64,
}

async fn write_metadata(path: &Path, start_time: chrono::DateTime<chrono::Utc>, frame_count: u64) {
    let metadata = RecordingMetadata {
        start_time_unix: start_time.timestamp() as f64,
        end_time_unix: Some(chrono::Utc::now().timestamp() as f64),
        frame_count,
    };
    match serde_json::to_vec_pretty(&metadata) {
        Ok(body) => {
            if let Err(e) = tokio::fs::write(path, body).await {
                warn!(error = %e, "failed to write recording metadata");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize recording metadata"),
    }
}

const OVERLAY_MARGIN: usize = 4;
const GLYPH_WIDTH: usize = 3;
const GLYPH_HEIGHT: usize = 5;
const GLYPH_SPACING: usize = 1;

/// Draws a small top-left overlay: `ISO-timestamp #frame_number`, white
/// pixels over whatever background, on BGR24 data.
fn draw_overlay(bgr_data: &[u8], width: u32, height: u32, frame_number: u64, wall_time_unix: f64) -> Vec<u8> {
    let mut out = bgr_data.to_vec();
    let label = overlay_label(frame_number, wall_time_unix);
    rasterize_text(&mut out, width as usize, height as usize, &label, OVERLAY_MARGIN, OVERLAY_MARGIN);
    out
}

fn overlay_label(frame_number: u64, wall_time_unix: f64) -> String {
    let dt = chrono::DateTime::from_timestamp(wall_time_unix as i64, 0).unwrap_or_default();
    format!("{} #{}", dt.to_rfc3339(), frame_number)
}

/// 3x5 bitmap font covering the characters an RFC3339 timestamp plus a
/// `#frame_number` suffix can contain. Unknown characters render blank.
fn glyph_bitmap(c: char) -> [u8; GLYPH_HEIGHT] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '+' => [0b000, 0b010, 0b111, 0b010, 0b000],
        '#' => [0b101, 0b111, 0b101, 0b111, 0b101],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        _ => [0, 0, 0, 0, 0],
    }
}

/// Blits `text` onto a BGR24 buffer at `(x0, y0)` one glyph at a time,
/// clipping at the frame edges instead of panicking on overflow.
fn rasterize_text(buf: &mut [u8], width: usize, height: usize, text: &str, x0: usize, y0: usize) {
    let mut cx = x0;
    for c in text.chars() {
        if cx >= width {
            break;
        }
        for (row, bits) in glyph_bitmap(c).iter().enumerate() {
            let py = y0 + row;
            if py >= height {
                break;
            }
            for col in 0..GLYPH_WIDTH {
                if *bits & (1u8 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let px = cx + col;
                if px >= width {
                    continue;
                }
                let idx = (py * width + px) * 3;
                if idx + 2 < buf.len() {
                    buf[idx] = 255;
                    buf[idx + 1] = 255;
                    buf[idx + 2] = 255;
                }
            }
        }
        cx += GLYPH_WIDTH + GLYPH_SPACING;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_label_includes_frame_number() {
        let label = overlay_label(42, 1_700_000_000.0);
        assert!(label.ends_with("#42"));
    }

    #[test]
    fn draw_overlay_sets_some_pixels_white() {
        let width = 32u32;
        let height = 16u32;
        let black = vec![0u8; (width * height * 3) as usize];
        let overlaid = draw_overlay(&black, width, height, 7, 1_700_000_000.0);
        assert_eq!(overlaid.len(), black.len());
        assert!(overlaid.iter().any(|&b| b == 255));
        assert!(overlaid.iter().zip(black.iter()).any(|(a, b)| a != b));
    }

    #[test]
    fn draw_overlay_does_not_panic_on_tiny_frame() {
        let width = 2u32;
        let height = 2u32;
        let black = vec![0u8; (width * height * 3) as usize];
        let overlaid = draw_overlay(&black, width, height, 1, 1_700_000_000.0);
        assert_eq!(overlaid.len(), black.len());
    }
}
