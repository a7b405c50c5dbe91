// SPDX-License-Identifier: GPL-3.0-only

//! Error kinds shared across the supervisor and module processes.

use std::fmt;
use std::path::PathBuf;

pub type AppResult<T> = Result<T, AppError>;

/// Top-level application error kinds shared by the supervisor and module
/// processes.
#[derive(Debug)]
pub enum AppError {
    /// Session directory resolved outside the configured output root, or a path
    /// component failed sanitization into something usable.
    InvalidSessionPath(PathBuf),
    /// Backend could not locate the requested device.
    DeviceNotFound(String),
    /// Backend device disappeared mid-stream.
    DeviceLost(String),
    /// Backend initialization failed; caller may retry.
    OpenError(String),
    /// Encoder refused a frame or muxer initialization failed.
    EncoderError(String),
    /// Malformed JSON or unknown command on the wire protocol.
    CommandProtocolError(String),
    /// Operation requested in a module/camera state that forbids it.
    StateTransitionError(String),
    /// Target config file was not writable; override path also failed.
    ConfigWriteError(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// Catch-all for I/O failures outside the above categories.
    Io(std::io::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSessionPath(p) => write!(f, "invalid session path: {}", p.display()),
            Self::DeviceNotFound(d) => write!(f, "device not found: {d}"),
            Self::DeviceLost(d) => write!(f, "device lost: {d}"),
            Self::OpenError(m) => write!(f, "open error: {m}"),
            Self::EncoderError(m) => write!(f, "encoder error: {m}"),
            Self::CommandProtocolError(m) => write!(f, "command protocol error: {m}"),
            Self::StateTransitionError(m) => write!(f, "state transition error: {m}"),
            Self::ConfigWriteError(m) => write!(f, "config write error: {m}"),
            Self::Timeout(m) => write!(f, "timeout: {m}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::CommandProtocolError(e.to_string())
    }
}

/// Errors specific to a capture backend, kept distinct from `AppError` so
/// backend implementations don't need to know about session/config concerns.
#[derive(Debug)]
pub enum BackendError {
    NotAvailable(String),
    InitializationFailed(String),
    DeviceNotFound(String),
    DeviceLost(String),
    FormatNotSupported(String),
    Io(std::io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAvailable(m) => write!(f, "backend not available: {m}"),
            Self::InitializationFailed(m) => write!(f, "initialization failed: {m}"),
            Self::DeviceNotFound(m) => write!(f, "device not found: {m}"),
            Self::DeviceLost(m) => write!(f, "device lost: {m}"),
            Self::FormatNotSupported(m) => write!(f, "format not supported: {m}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BackendError> for AppError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotAvailable(m) => AppError::OpenError(m),
            BackendError::InitializationFailed(m) => AppError::OpenError(m),
            BackendError::DeviceNotFound(m) => AppError::DeviceNotFound(m),
            BackendError::DeviceLost(m) => AppError::DeviceLost(m),
            BackendError::FormatNotSupported(m) => AppError::OpenError(m),
            BackendError::Io(e) => AppError::Io(e),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
