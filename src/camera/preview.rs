// SPDX-License-Identifier: GPL-3.0-only

//! Preview Pipeline: FPS-capped, decimation-aware consumer driving a UI sink.

use crate::camera::router::PreviewRing;
use crate::camera::types::Frame;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct PreviewMetrics {
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
}

struct Decimation {
    target_fps: Option<f64>,
    keep_every: Option<u32>,
}

/// Owns the consumer loop that decimates and forwards preview frames to a
/// UI sink callback. Per-frame algorithm (spec §4.G): keep-every gate first,
/// then a target-fps minimum-interval gate, then the sink call.
pub struct PreviewPipeline {
    decimation: Arc<RwLock<Decimation>>,
    metrics: Arc<PreviewMetrics>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl PreviewPipeline {
    pub fn start<F>(preview_ring: Arc<PreviewRing>, target_fps: Option<f64>, keep_every: Option<u32>, sink: F) -> Self
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let decimation = Arc::new(RwLock::new(Decimation { target_fps, keep_every }));
        let metrics = Arc::new(PreviewMetrics::default());
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let task_decimation = decimation.clone();
        let task_metrics = metrics.clone();
        let task_stop = stop.clone();
        let task_stopped = stopped.clone();
        let sink = Arc::new(sink);
        let emit_count = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            let mut last_emit: Option<Instant> = None;
            loop {
                let frame = tokio::select! {
                    item = preview_ring.pop() => item.flatten(),
                    _ = task_stop.notified() => None,
                };
                let Some(frame) = frame else { break };

                let count = emit_count.fetch_add(1, Ordering::SeqCst) + 1;
                let decim = task_decimation.read().await;

                if let Some(keep_every) = decim.keep_every
                    && keep_every > 1
                    && count % keep_every != 0
                {
                    task_metrics.dropped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }

                if let Some(target_fps) = decim.target_fps {
                    let min_interval = std::time::Duration::from_secs_f64(1.0 / target_fps.max(0.01));
                    if let Some(last) = last_emit
                        && last.elapsed() < min_interval
                    {
                        task_metrics.dropped.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                }
                drop(decim);

                last_emit = Some(Instant::now());
                task_metrics.emitted.fetch_add(1, Ordering::SeqCst);

                let sink = sink.clone();
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(frame))).is_err() {
                    warn!("preview sink panicked, continuing");
                }
            }
            task_stopped.store(true, Ordering::SeqCst);
            debug!("preview pipeline stopped");
        });

        Self {
            decimation,
            metrics,
            stop,
            stopped,
        }
    }

    pub async fn set_target_fps(&self, fps: Option<f64>) {
        self.decimation.write().await.target_fps = fps;
    }

    pub async fn set_keep_every(&self, keep_every: Option<u32>) {
        self.decimation.write().await.keep_every = keep_every;
    }

    pub fn metrics(&self) -> Arc<PreviewMetrics> {
        self.metrics.clone()
    }

    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn keep_every_emits_ceiling_of_total_over_n() {
        let total = 17u32;
        let keep_every = 5u32;
        let emitted = (1..=total).filter(|c| c % keep_every == 0).count() as u32;
        assert_eq!(emitted, total / keep_every);
    }
}
