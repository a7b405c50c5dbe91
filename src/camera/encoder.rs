// SPDX-License-Identifier: GPL-3.0-only

//! Video encoder abstraction for the record pipeline: an appsrc-fed
//! GStreamer pipeline with explicit PTS control, grounded on
//! `pipelines/video/recorder.rs`'s appsrc path and `muxer.rs`'s linking
//! helpers, generalized from running-time PTS to the microsecond PTS
//! algorithm used here.

use crate::errors::{AppError, AppResult};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Encoders attempted in order; the first whose factory is installed wins.
const PREFERRED_ENCODERS: &[&str] = &["v4l2h264enc", "x264enc"];
const FALLBACK_ENCODER: &str = "openh264enc";

pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

fn pick_encoder_factory() -> &'static str {
    for name in PREFERRED_ENCODERS {
        if gst::ElementFactory::find(name).is_some() {
            return name;
        }
    }
    FALLBACK_ENCODER
}

/// Tracks the PTS state machine from spec §4.H: first frame establishes the
/// base, subsequent PTS values are clamped deltas in a microsecond timebase,
/// kept strictly increasing.
struct PtsClock {
    base_pts_ns: AtomicI64,
    base_set: std::sync::atomic::AtomicBool,
    last_pts_ticks: AtomicI64,
    start: std::time::Instant,
}

impl PtsClock {
    fn new() -> Self {
        Self {
            base_pts_ns: AtomicI64::new(0),
            base_set: std::sync::atomic::AtomicBool::new(false),
            last_pts_ticks: AtomicI64::new(-1),
            start: std::time::Instant::now(),
        }
    }

    fn next_pts_ticks(&self, pts_source_ns: i64) -> i64 {
        if !self.base_set.swap(true, Ordering::SeqCst) {
            self.base_pts_ns.store(pts_source_ns, Ordering::SeqCst);
        }
        let base = self.base_pts_ns.load(Ordering::SeqCst);
        let delta_ns = (pts_source_ns - base).max(0);

        let elapsed_ns = self.start.elapsed().as_nanos() as i64;
        let clamp_ceiling = elapsed_ns + 100_000_000;
        let clamped_delta = delta_ns.min(clamp_ceiling);

        let mut ticks = clamped_delta / 1_000;
        let last = self.last_pts_ticks.load(Ordering::SeqCst);
        if ticks <= last {
            ticks = last + 1;
        }
        self.last_pts_ticks.store(ticks, Ordering::SeqCst);
        ticks
    }
}

/// A running encoder pipeline: appsrc -> encoder -> muxer -> filesink.
pub struct EncoderHandle {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    pts_clock: Arc<PtsClock>,
    frame_duration_ns: i64,
}

impl EncoderHandle {
    pub fn start(output_path: &Path, config: &EncoderConfig) -> AppResult<Self> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pipeline = gst::Pipeline::new();
        let encoder_name = pick_encoder_factory();

        let appsrc = gst::ElementFactory::make("appsrc")
            .name("record-appsrc")
            .property("format", gst::Format::Time)
            .property("is-live", true)
            .build()
            .map_err(|e| AppError::EncoderError(format!("appsrc: {e}")))?;
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "BGR")
            .field("width", config.width as i32)
            .field("height", config.height as i32)
            .field("framerate", gst::Fraction::approximate_f64(config.fps).unwrap_or(gst::Fraction::new(30, 1)))
            .build();
        appsrc.set_property("caps", &caps);

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| AppError::EncoderError(format!("videoconvert: {e}")))?;
        let encoder = gst::ElementFactory::make(encoder_name)
            .build()
            .map_err(|e| AppError::EncoderError(format!("{encoder_name}: {e}")))?;
        let parser = gst::ElementFactory::make("h264parse")
            .build()
            .map_err(|e| AppError::EncoderError(format!("h264parse: {e}")))?;
        let muxer = gst::ElementFactory::make("mp4mux")
            .build()
            .map_err(|e| AppError::EncoderError(format!("mp4mux: {e}")))?;
        if muxer.has_property("streamable") {
            let _ = muxer.set_property("streamable", false);
        }
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", output_path.to_string_lossy().as_ref())
            .build()
            .map_err(|e| AppError::EncoderError(format!("filesink: {e}")))?;

        pipeline
            .add_many([&appsrc, &videoconvert, &encoder, &parser, &muxer, &filesink])
            .map_err(|e| AppError::EncoderError(e.to_string()))?;
        gst::Element::link_many([&appsrc, &videoconvert, &encoder, &parser, &muxer])
            .map_err(|e| AppError::EncoderError(format!("video chain link: {e}")))?;
        muxer
            .link(&filesink)
            .map_err(|e| AppError::EncoderError(format!("muxer->filesink link: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AppError::EncoderError(format!("set_state playing: {e}")))?;

        let appsrc = appsrc
            .dynamic_cast::<gst_app::AppSrc>()
            .map_err(|_| AppError::EncoderError("appsrc cast failed".to_string()))?;

        info!(encoder = encoder_name, path = %output_path.display(), "encoder started");

        Ok(Self {
            pipeline,
            appsrc,
            pts_clock: Arc::new(PtsClock::new()),
            frame_duration_ns: (1_000_000_000.0 / config.fps.max(1.0)) as i64,
        })
    }

    /// Enqueue one frame. Caller is responsible for delivering BGR-ordered
    /// data (the record pipeline performs the RGB->BGR swap upstream so it
    /// can also apply the overlay in the same color space). `pts_source_ns`
    /// is `sensor_timestamp_ns` when present, else `monotonic_ns`.
    pub fn enqueue(&self, data: &[u8], pts_source_ns: i64) -> AppResult<()> {
        let bytes = data;
        let pts_ticks = self.pts_clock.next_pts_ticks(pts_source_ns);
        let pts_ns = (pts_ticks as u64) * 1_000;

        let mut buffer = gst::Buffer::from_mut_slice(bytes.to_vec());
        {
            let buf_ref = buffer.get_mut().ok_or_else(|| AppError::EncoderError("buffer not writable".to_string()))?;
            buf_ref.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            buf_ref.set_duration(gst::ClockTime::from_nseconds(self.frame_duration_ns.max(0) as u64));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|_| AppError::EncoderError("appsrc rejected buffer".to_string()))?;
        Ok(())
    }

    /// Periodic durability checkpoint: flush the muxer and fsync the file.
    pub fn checkpoint(&self, output_path: &Path) {
        if let Err(e) = std::fs::File::open(output_path).and_then(|f| f.sync_all()) {
            warn!(error = %e, "encoder checkpoint fsync failed");
        }
    }

    /// Drains the pipeline to EOS, then tears it down.
    pub fn stop(self) {
        let _ = self.appsrc.end_of_stream();
        let bus = self.pipeline.bus();
        if let Some(bus) = bus {
            let _ = bus.timed_pop_filtered(gst::ClockTime::from_seconds(10), &[gst::MessageType::Eos, gst::MessageType::Error]);
        }
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub fn swap_rgb_bgr(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(3) {
        chunk.swap(0, 2);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_strictly_increases_even_on_equal_source_timestamps() {
        let clock = PtsClock::new();
        let first = clock.next_pts_ticks(1_000_000);
        let second = clock.next_pts_ticks(1_000_000);
        assert!(second > first);
    }

    #[test]
    fn pts_clamps_runaway_future_timestamps() {
        let clock = PtsClock::new();
        let first = clock.next_pts_ticks(0);
        assert_eq!(first, 0);
        // a timestamp far in the future should be clamped near elapsed + 100ms
        let huge = clock.next_pts_ticks(1_000_000_000_000);
        assert!(huge < 1_000_000_000);
    }

    #[test]
    fn swap_rgb_bgr_reverses_channel_order() {
        let rgb = vec![10u8, 20, 30, 40, 50, 60];
        let bgr = swap_rgb_bgr(&rgb);
        assert_eq!(bgr, vec![30, 20, 10, 60, 50, 40]);
    }
}
