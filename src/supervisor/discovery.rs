// SPDX-License-Identifier: GPL-3.0-only

//! USB device monitor: polls camera device enumeration on an interval and
//! emits connect/disconnect events keyed by the device's stable identity.
//! Grounded on `backends/camera/usb.rs`'s sysfs discovery walk, generalized
//! from a one-shot probe into a polling diff loop the supervisor can watch.

use crate::camera::types::CameraId;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected { device_key: String, camera: CameraId },
    Disconnected { device_key: String },
}

/// Spawns a polling task that diffs `CameraRuntime::discover_all`-equivalent
/// enumeration against the previous snapshot, sending one event per change.
/// Returns the receiver side; the task exits when the sender is dropped.
pub fn spawn_camera_monitor() -> (mpsc::Receiver<DeviceEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move {
        let mut known: HashSet<String> = HashSet::new();
        loop {
            let discovered = discover_all();
            let current: HashSet<String> = discovered.iter().map(|c| c.key()).collect();

            for camera in &discovered {
                let key = camera.key();
                if !known.contains(&key) {
                    debug!(device = %key, "camera device connected");
                    if tx.send(DeviceEvent::Connected { device_key: key.clone(), camera: camera.clone() }).await.is_err() {
                        return;
                    }
                }
            }
            for key in known.difference(&current) {
                debug!(device = %key, "camera device disconnected");
                if tx.send(DeviceEvent::Disconnected { device_key: key.clone() }).await.is_err() {
                    return;
                }
            }
            known = current;

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    });
    info!("camera device monitor started");
    (rx, handle)
}

fn discover_all() -> Vec<CameraId> {
    use crate::camera::backend::csi::discover_csi_cameras;
    use crate::camera::backend::usb::discover_usb_cameras;
    use std::collections::HashMap;

    let mut by_key: HashMap<String, CameraId> = HashMap::new();
    for id in discover_usb_cameras() {
        by_key.insert(id.key(), id);
    }
    for id in discover_csi_cameras() {
        by_key.insert(id.key(), id);
    }
    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_event_carries_stable_key() {
        let camera = CameraId::new(crate::camera::types::BackendKind::Usb, "1-2");
        let event = DeviceEvent::Connected {
            device_key: camera.key(),
            camera: camera.clone(),
        };
        match event {
            DeviceEvent::Connected { device_key, .. } => assert_eq!(device_key, "usb:1-2"),
            _ => panic!("expected Connected"),
        }
    }
}
