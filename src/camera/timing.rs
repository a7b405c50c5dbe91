// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame drop accounting and timestamp normalization, grounded on
//! `record/timing.py`'s `FrameTimingTracker`.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingUpdate {
    pub hardware_frame_number: u64,
    pub sensor_timestamp_ns: i64,
    pub dropped_since_last: u64,
    pub total_hardware_drops: u64,
}

#[derive(Debug, Default)]
pub struct FrameTimingTracker {
    last_frame_number: Option<u64>,
    total_drops: u64,
}

impl FrameTimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_frame_number = None;
        self.total_drops = 0;
    }

    pub fn update(
        &mut self,
        frame_number: Option<u64>,
        sensor_timestamp_ns: Option<i64>,
        monotonic_time_s: f64,
    ) -> TimingUpdate {
        let current = frame_number.unwrap_or_else(|| self.last_frame_number.map(|n| n + 1).unwrap_or(0));

        let dropped_since_last = match self.last_frame_number {
            Some(last) if current > last => (current - last).saturating_sub(1),
            _ => 0,
        };
        self.total_drops += dropped_since_last;
        self.last_frame_number = Some(current);

        let sensor_ts = sensor_timestamp_ns.unwrap_or_else(|| (monotonic_time_s * 1e9) as i64);

        TimingUpdate {
            hardware_frame_number: current,
            sensor_timestamp_ns: sensor_ts,
            dropped_since_last,
            total_hardware_drops: self.total_drops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_frame_number_when_absent() {
        let mut tracker = FrameTimingTracker::new();
        let u1 = tracker.update(None, None, 1.0);
        assert_eq!(u1.hardware_frame_number, 0);
        let u2 = tracker.update(None, None, 2.0);
        assert_eq!(u2.hardware_frame_number, 1);
        assert_eq!(u2.dropped_since_last, 0);
    }

    #[test]
    fn counts_drops_when_frame_numbers_skip() {
        let mut tracker = FrameTimingTracker::new();
        tracker.update(Some(10), None, 0.0);
        let update = tracker.update(Some(14), None, 0.0);
        assert_eq!(update.dropped_since_last, 3);
        assert_eq!(update.total_hardware_drops, 3);

        let update2 = tracker.update(Some(20), None, 0.0);
        assert_eq!(update2.dropped_since_last, 5);
        assert_eq!(update2.total_hardware_drops, 8);
    }

    #[test]
    fn falls_back_to_monotonic_timestamp() {
        let mut tracker = FrameTimingTracker::new();
        let update = tracker.update(Some(0), None, 1.5);
        assert_eq!(update.sensor_timestamp_ns, 1_500_000_000);
    }

    #[test]
    fn prefers_sensor_timestamp_when_present() {
        let mut tracker = FrameTimingTracker::new();
        let update = tracker.update(Some(0), Some(42), 1.5);
        assert_eq!(update.sensor_timestamp_ns, 42);
    }
}
