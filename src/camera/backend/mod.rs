// SPDX-License-Identifier: GPL-3.0-only

//! Capture backend abstraction: a uniform async frame source over
//! heterogeneous devices (CSI, UVC).

pub mod csi;
pub mod usb;

use crate::camera::types::{CameraCapabilities, CapabilityMode, Frame};
use crate::errors::BackendResult;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Implemented by each concrete device family (USB UVC, CSI).
pub trait CaptureBackend: Send + Sync {
    /// Probe a device's supported modes without opening it for streaming.
    /// May be called while the device is closed.
    fn probe(&self, location: &str) -> BackendResult<Option<CameraCapabilities>>;

    /// Open the device configured for `mode` and begin streaming frames on
    /// a dedicated worker, returning a handle to consume them.
    fn open(&self, location: &str, mode: &CapabilityMode) -> BackendResult<CaptureHandle>;
}

/// Bounded, drop-oldest queue shared between a producer (which never blocks
/// on a slow consumer) and an async consumer. Used by the capture backends,
/// whose underlying driver cannot tolerate backpressure from the runtime, and
/// by the router's preview fan-out, which must keep only the freshest frame
/// under load rather than the oldest still-queued one.
pub struct DropOldestRing<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> DropOldestRing<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Producer-side push. Drops the oldest queued item when full. Returns
    /// `true` if an item had to be evicted to make room.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        let evicted = if items.len() >= self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        evicted
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().unwrap().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// A capture backend's ring, specialized to the frame-or-error items the
/// device worker produces.
pub type FrameRing = DropOldestRing<BackendResult<Frame>>;

enum FrameSource {
    Channel(mpsc::Receiver<BackendResult<Frame>>),
    Ring(Arc<FrameRing>),
}

/// A live, streaming device. Frames arrive on an internal channel fed by a
/// dedicated worker thread or task, decoupling capture from the consumer's
/// scheduling.
pub struct CaptureHandle {
    source: FrameSource,
    stop_flag: Arc<AtomicBool>,
}

impl CaptureHandle {
    pub fn from_channel(receiver: mpsc::Receiver<BackendResult<Frame>>, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            source: FrameSource::Channel(receiver),
            stop_flag,
        }
    }

    pub fn from_ring(ring: Arc<FrameRing>, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            source: FrameSource::Ring(ring),
            stop_flag,
        }
    }

    /// Pull the next frame. Returns `None` once the worker has exited
    /// (stopped or device lost after signaling through the channel).
    pub async fn next_frame(&mut self) -> Option<BackendResult<Frame>> {
        match &mut self.source {
            FrameSource::Channel(rx) => rx.recv().await,
            FrameSource::Ring(ring) => ring.pop().await,
        }
    }

    /// Idempotent; safe to call from any task. The worker observes the flag
    /// and exits at its next poll point.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let FrameSource::Ring(ring) = &self.source {
            ring.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}
