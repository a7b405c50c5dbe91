// SPDX-License-Identifier: GPL-3.0-only

//! Frame Queues & Router: one capture source, two independently-policed
//! sinks. Grounded on `router.py`'s `Router`/`_enqueue_coalescing`.

use crate::camera::backend::{CaptureHandle, DropOldestRing};
use crate::camera::types::{Frame, ModeSelection};
use crate::errors::BackendError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub ingress_frames: AtomicU64,
    pub preview_dropped: AtomicU64,
    pub record_backpressure: AtomicU64,
}

/// Preview sink ring: `Option<Frame>` items, `None` is the shutdown sentinel.
pub type PreviewRing = DropOldestRing<Option<Frame>>;

/// The two sink handles produced by `attach`. The preview side is a
/// drop-oldest ring so a slow consumer loses stale frames, never fresh ones;
/// the record side is a blocking `mpsc` channel since record must not drop.
pub struct RouterQueues {
    pub preview_ring: Arc<PreviewRing>,
    pub record_rx: mpsc::Receiver<Option<Frame>>,
}

struct Gates {
    preview_enabled: AtomicBool,
    record_enabled: AtomicBool,
    wake: Notify,
}

/// Owns the single consumer task that fans one camera's frames out to a
/// coalescing preview queue and a blocking record queue.
pub struct Router {
    gates: Arc<Gates>,
    metrics: Arc<RouterMetrics>,
    cancel: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
    record_tx: Arc<AsyncMutex<mpsc::Sender<Option<Frame>>>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        handle: CaptureHandle,
        _selection: ModeSelection,
        preview_queue_size: usize,
        record_queue_size: usize,
        preview_enabled: bool,
        record_enabled: bool,
    ) -> (Self, RouterQueues) {
        let preview_ring = PreviewRing::new(preview_queue_size.max(1));
        let (record_tx, record_rx) = mpsc::channel(record_queue_size.max(1));
        let gates = Arc::new(Gates {
            preview_enabled: AtomicBool::new(preview_enabled),
            record_enabled: AtomicBool::new(record_enabled),
            wake: Notify::new(),
        });
        let metrics = Arc::new(RouterMetrics::default());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(Notify::new());
        let record_tx = Arc::new(AsyncMutex::new(record_tx));

        let task_gates = gates.clone();
        let task_metrics = metrics.clone();
        let task_stop = stop_flag.clone();
        let task_cancel = cancel.clone();
        let task_preview_ring = preview_ring.clone();
        let task_record_tx = record_tx.clone();

        tokio::spawn(async move {
            run_router(handle, task_gates, task_metrics, task_stop, task_cancel, task_preview_ring, task_record_tx).await;
        });

        (
            Self {
                gates,
                metrics,
                cancel,
                stop_flag,
                record_tx,
            },
            RouterQueues { preview_ring, record_rx },
        )
    }

    pub fn set_preview_enabled(&self, enabled: bool) {
        self.gates.preview_enabled.store(enabled, Ordering::SeqCst);
        self.gates.wake.notify_one();
    }

    pub async fn set_record_enabled(&self, enabled: bool) {
        self.gates.record_enabled.store(enabled, Ordering::SeqCst);
        self.gates.wake.notify_one();
        if !enabled {
            let _ = self.record_tx.lock().await.try_send(None);
        }
    }

    pub fn metrics(&self) -> Arc<RouterMetrics> {
        self.metrics.clone()
    }

    /// Swaps in a fresh record channel, returning the new receiver. Used
    /// between trials: the previous receiver is consumed and dropped by the
    /// finished `RecordPipeline`, so a new pair is needed before the next
    /// recording can start.
    pub async fn reattach_record_channel(&self, queue_size: usize) -> mpsc::Receiver<Option<Frame>> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        *self.record_tx.lock().await = tx;
        rx
    }

    /// Cancels the consumer task, interrupting an in-flight source read,
    /// and enqueues a terminal sentinel into both queues so downstream
    /// consumers exit cleanly.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
        self.gates.wake.notify_one();
    }
}

async fn run_router(
    mut handle: CaptureHandle,
    gates: Arc<Gates>,
    metrics: Arc<RouterMetrics>,
    stop_flag: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    preview_ring: Arc<PreviewRing>,
    record_tx: Arc<AsyncMutex<mpsc::Sender<Option<Frame>>>>,
) {
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }

        if !gates.preview_enabled.load(Ordering::SeqCst) && !gates.record_enabled.load(Ordering::SeqCst) {
            tokio::select! {
                _ = gates.wake.notified() => {}
                _ = cancel.notified() => break,
            }
            continue;
        }

        let next = tokio::select! {
            frame = handle.next_frame() => frame,
            _ = cancel.notified() => break,
        };

        match next {
            Some(Ok(frame)) => {
                metrics.ingress_frames.fetch_add(1, Ordering::SeqCst);
                fan_out_frame(frame, &gates, &metrics, &preview_ring, &record_tx).await;
            }
            Some(Err(BackendError::DeviceLost(msg))) => {
                warn!(error = %msg, "router: device lost, stopping");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "router: frame read error, continuing");
            }
            None => {
                debug!("router: source exhausted");
                break;
            }
        }
    }

    handle.stop();
    preview_ring.close();
    let _ = record_tx.lock().await.send(None).await;
    info!("router consumer task exited");
}

async fn fan_out_frame(
    frame: Frame,
    gates: &Gates,
    metrics: &RouterMetrics,
    preview_ring: &PreviewRing,
    record_tx: &AsyncMutex<mpsc::Sender<Option<Frame>>>,
) {
    if gates.preview_enabled.load(Ordering::SeqCst) {
        enqueue_coalescing(preview_ring, frame.clone(), metrics);
    }

    if gates.record_enabled.load(Ordering::SeqCst) {
        let sender = record_tx.lock().await.clone();
        match sender.try_send(Some(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                metrics.record_backpressure.fetch_add(1, Ordering::SeqCst);
                let _ = sender.send(item).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Preview enqueue policy: on a full ring, drop the oldest queued frame and
/// admit the new one (spec's "dequeue the oldest item and retry" rule),
/// never the reverse.
fn enqueue_coalescing(ring: &PreviewRing, frame: Frame, metrics: &RouterMetrics) {
    if ring.push(Some(frame)) {
        metrics.preview_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngressFpsSample {
    pub instant_fps: f64,
    pub average_fps: f64,
}

/// Sliding-window ingress FPS counter.
pub struct FpsCounter {
    window: std::collections::VecDeque<Instant>,
    window_secs: f64,
}

impl FpsCounter {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: std::collections::VecDeque::new(),
            window_secs,
        }
    }

    pub fn record(&mut self, now: Instant) -> IngressFpsSample {
        self.window.push_back(now);
        while let Some(front) = self.window.front() {
            if now.duration_since(*front).as_secs_f64() > self.window_secs {
                self.window.pop_front();
            } else {
                break;
            }
        }
        let instant_fps = self
            .window
            .iter()
            .rev()
            .nth(1)
            .map(|prev| 1.0 / now.duration_since(*prev).as_secs_f64().max(1e-6))
            .unwrap_or(0.0);
        let average_fps = self.window.len() as f64 / self.window_secs;
        IngressFpsSample { instant_fps, average_fps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::backend::csi::CsiBackend;
    use crate::camera::backend::CaptureBackend;
    use crate::camera::types::{CapabilityMode, ModeSelection};
    use std::collections::HashMap;

    fn test_mode() -> CapabilityMode {
        CapabilityMode {
            width: 64,
            height: 48,
            fps: 100.0,
            pixel_format: "SBGGR10".to_string(),
            controls: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn preview_path_coalesces_under_backpressure() {
        let backend = CsiBackend;
        let handle = backend.open("/dev/video0", &test_mode()).unwrap();
        let (router, queues) = Router::attach(handle, ModeSelection::new(test_mode()), 1, 4, true, false);

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        router.stop().await;

        let mut count = 0;
        while let Some(item) = queues.preview_ring.pop().await {
            if item.is_none() {
                break;
            }
            count += 1;
        }
        assert!(count >= 1);
        assert!(router.metrics().preview_dropped.load(Ordering::SeqCst) >= 0);
    }

    #[tokio::test]
    async fn preview_ring_drops_oldest_not_newest_under_backpressure() {
        let ring = PreviewRing::new(2);
        let metrics = RouterMetrics::default();
        for i in 0..4u64 {
            enqueue_coalescing(
                &ring,
                Frame {
                    data: vec![],
                    frame_number: i,
                    monotonic_ns: 0,
                    sensor_timestamp_ns: None,
                    wall_time_unix: 0.0,
                    wait_ms: 0.0,
                    color_format: crate::camera::types::ColorFormat::Bgr,
                    storage_queue_drops: 0,
                },
                &metrics,
            );
        }
        let first = ring.pop().await.unwrap().unwrap();
        let second = ring.pop().await.unwrap().unwrap();
        assert_eq!(first.frame_number, 2);
        assert_eq!(second.frame_number, 3);
        assert_eq!(metrics.preview_dropped.load(Ordering::SeqCst), 2);
    }
}
