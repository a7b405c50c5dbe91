// SPDX-License-Identifier: GPL-3.0-only

//! Buffered per-frame timing CSV writer, grounded on `record/csv_logger.py`.

use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error};

pub const CSV_HEADER: &str = "trial,frame_number,write_time_unix,monotonic_time,sensor_timestamp_ns,hardware_frame_number,dropped_since_last,total_hardware_drops,storage_queue_drops";

#[derive(Debug, Clone)]
pub struct CSVRecord {
    pub trial: Option<u32>,
    pub frame_number: u64,
    pub write_time_unix: f64,
    pub monotonic_time: f64,
    pub sensor_timestamp_ns: Option<i64>,
    pub hardware_frame_number: Option<u64>,
    pub dropped_since_last: Option<u64>,
    pub total_hardware_drops: u64,
    pub storage_queue_drops: u32,
}

impl CSVRecord {
    fn to_row(&self) -> String {
        format!(
            "{},{},{:.6},{:.9},{},{},{},{},{}",
            self.trial.map(|t| t.to_string()).unwrap_or_default(),
            self.frame_number,
            self.write_time_unix,
            self.monotonic_time,
            self.sensor_timestamp_ns.map(|v| v.to_string()).unwrap_or_default(),
            self.hardware_frame_number.map(|v| v.to_string()).unwrap_or_default(),
            self.dropped_since_last.map(|v| v.to_string()).unwrap_or_default(),
            self.total_hardware_drops,
            self.storage_queue_drops,
        )
    }
}

struct Inner {
    path: Option<PathBuf>,
    buffer: Vec<String>,
    degraded: bool,
}

/// A buffered append-only CSV writer. Never blocks the record pipeline:
/// `log_frame` only pushes to an in-memory buffer, `flush` does the I/O
/// under its own lock.
pub struct CSVLogger {
    inner: Mutex<Inner>,
}

impl Default for CSVLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl CSVLogger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                path: None,
                buffer: Vec::new(),
                degraded: false,
            }),
        }
    }

    pub async fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut inner = self.inner.lock().await;
        let needs_header = !path.exists() || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if needs_header {
            let mut file = std::fs::File::create(path)?;
            writeln!(file, "{CSV_HEADER}")?;
        }
        inner.path = Some(path.to_path_buf());
        inner.buffer.clear();
        inner.degraded = false;
        Ok(())
    }

    /// Buffer one row. Flushes automatically once `flush_every` rows have
    /// accumulated.
    pub async fn log_frame(&self, record: CSVRecord, flush_every: usize) {
        let should_flush = {
            let mut inner = self.inner.lock().await;
            inner.buffer.push(record.to_row());
            inner.buffer.len() >= flush_every
        };
        if should_flush {
            self.flush().await;
        }
    }

    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        if inner.buffer.is_empty() || inner.degraded {
            return;
        }
        let Some(path) = inner.path.clone() else {
            return;
        };
        let rows = std::mem::take(&mut inner.buffer);
        match std::fs::OpenOptions::new().append(true).open(&path) {
            Ok(mut file) => {
                let mut body = rows.join("\n");
                body.push('\n');
                if let Err(e) = file.write_all(body.as_bytes()) {
                    error!(path = %path.display(), error = %e, "csv logger write failed, entering degraded mode");
                    inner.degraded = true;
                } else {
                    debug!(path = %path.display(), rows = rows.len(), "csv logger flushed");
                }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "csv logger failed to open file, entering degraded mode");
                inner.degraded = true;
            }
        }
    }

    pub async fn stop(&self) {
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_header_once_and_buffers_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.csv");
        let logger = CSVLogger::new();
        logger.start(&path).await.unwrap();

        logger
            .log_frame(
                CSVRecord {
                    trial: Some(1),
                    frame_number: 0,
                    write_time_unix: 100.123456,
                    monotonic_time: 1.0,
                    sensor_timestamp_ns: Some(42),
                    hardware_frame_number: Some(0),
                    dropped_since_last: Some(0),
                    total_hardware_drops: 0,
                    storage_queue_drops: 0,
                },
                100,
            )
            .await;
        logger.stop().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("1,0,100.123456"));
    }

    #[tokio::test]
    async fn auto_flushes_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.csv");
        let logger = CSVLogger::new();
        logger.start(&path).await.unwrap();

        for i in 0..3 {
            logger
                .log_frame(
                    CSVRecord {
                        trial: None,
                        frame_number: i,
                        write_time_unix: 0.0,
                        monotonic_time: 0.0,
                        sensor_timestamp_ns: None,
                        hardware_frame_number: None,
                        dropped_since_last: None,
                        total_hardware_drops: 0,
                        storage_queue_drops: 0,
                    },
                    2,
                )
                .await;
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3); // header + 2 flushed rows
    }
}
