// SPDX-License-Identifier: GPL-3.0-only

//! Camera module child process: speaks the supervisor's line-delimited JSON
//! wire protocol over stdin/stdout and drives a `CameraRuntime` underneath.
//! Grounded on `main.rs`'s logging init and the wire protocol tables in
//! `process::wire`.

use clap::Parser;
use serde_json::json;
use session_capture::camera::types::CameraId;
use session_capture::camera::CameraRuntime;
use session_capture::process::wire::{decode_command, encode_status, Command, ParsedCommand, Status};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// The private duplicate of the real fd 1, taken before GStreamer gets a
/// chance to open anything and before fd 1 is redirected away from it. All
/// JSON status lines go through this handle instead of `tokio::io::stdout()`.
static STATUS_CHANNEL: OnceLock<Mutex<tokio::fs::File>> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "camera-module")]
struct Args {
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

struct ModuleState {
    runtime: CameraRuntime,
    session_dir: Option<PathBuf>,
    trial_number: Option<u32>,
    known_devices: HashMap<String, CameraId>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    if let Err(e) = protect_status_channel(args.log_file.as_ref()) {
        error!(error = %e, "failed to protect JSON status channel from native library writes to stdout");
    }

    // Ignore SIGINT: the supervisor owns shutdown via the `quit` command and
    // explicit signals sent to this process's pid directly, so a spurious
    // SIGINT forwarded to the whole process group should not kill us early.
    let _ = ctrlc::set_handler(|| {});

    let state = Arc::new(Mutex::new(ModuleState {
        runtime: CameraRuntime::new(),
        session_dir: None,
        trial_number: None,
        known_devices: HashMap::new(),
    }));

    emit_status(Status::new("initializing", json!({"message": "camera module starting"}))).await;
    emit_status(Status::new("initialized", json!({"ready_ms": 0}))).await;

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => {
                info!("stdin closed, exiting");
                break;
            }
            Err(e) => {
                error!(error = %e, "stdin read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_command(&line) {
            Ok(ParsedCommand::Known(command)) => {
                if matches!(command, Command::Quit) {
                    emit_status(Status::new("quitting", json!({"message": "quit received"}))).await;
                    break;
                }
                handle_command(&state, command).await;
            }
            Ok(ParsedCommand::Other { command, .. }) => {
                warn!(command, "unrecognized command, ignoring");
            }
            Err(e) => {
                warn!(error = %e, line, "malformed command line");
                emit_status(Status::new("error", json!({"error_code": "bad_command", "message": e.to_string()}))).await;
            }
        }
    }
}

async fn handle_command(state: &Arc<Mutex<ModuleState>>, command: Command) {
    match command {
        Command::StartSession { session_dir } => {
            state.lock().await.session_dir = Some(PathBuf::from(session_dir));
        }
        Command::StopSession => {
            let mut guard = state.lock().await;
            let ids: Vec<CameraId> = guard.known_devices.values().cloned().collect();
            for id in ids {
                if let Err(e) = guard.runtime.teardown_camera(&id).await {
                    warn!(camera = %id, error = %e, "failed to tear down camera at session stop");
                }
            }
            guard.known_devices.clear();
            guard.session_dir = None;
        }
        Command::StartRecording { trial_number, label } => {
            let mut guard = state.lock().await;
            guard.trial_number = Some(trial_number);
            let Some(session_dir) = guard.session_dir.clone() else {
                drop(guard);
                emit_status(Status::new("error", json!({"error_code": "no_session", "message": "start_recording before start_session"}))).await;
                return;
            };
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
            let ids: Vec<CameraId> = guard.known_devices.values().cloned().collect();
            for id in ids {
                if let Err(e) = guard.runtime.start_recording(&id, &session_dir, trial_number, &timestamp).await {
                    error!(camera = %id, error = %e, "failed to start recording");
                }
            }
            drop(guard);
            info!(trial_number, label, "recording started");
            emit_status(Status::new("recording_started", json!({"trial_number": trial_number}))).await;
        }
        Command::StopRecording => {
            let guard = state.lock().await;
            let trial_number = guard.trial_number;
            let ids: Vec<CameraId> = guard.known_devices.values().cloned().collect();
            for id in ids {
                if let Err(e) = guard.runtime.stop_recording(&id).await {
                    error!(camera = %id, error = %e, "failed to stop recording");
                }
            }
            drop(guard);
            emit_status(Status::new("recording_stopped", json!({"trial_number": trial_number}))).await;
        }
        Command::GetStatus => {
            let guard = state.lock().await;
            let data = json!({
                "state": if guard.trial_number.is_some() { "recording" } else { "idle" },
                "recording": guard.trial_number.is_some(),
                "trial_number": guard.trial_number,
                "camera_count": guard.known_devices.len(),
            });
            drop(guard);
            emit_status(Status::new("status_report", data)).await;
        }
        Command::AssignDevice { device_id, .. } => {
            let mut guard = state.lock().await;
            let candidates = guard.runtime.discover_all();
            let Some(camera) = candidates.into_iter().find(|c| c.key() == device_id) else {
                warn!(device_id, "assign_device: camera not found by current discovery pass");
                return;
            };
            if let Err(e) = guard.runtime.ensure_camera(&camera).await {
                error!(device_id, error = %e, "failed to open assigned camera");
                drop(guard);
                emit_status(Status::new("error", json!({"error_code": "open_error", "message": e.to_string()}))).await;
                return;
            }
            guard.known_devices.insert(device_id, camera);
        }
        Command::UnassignDevice { device_id } => {
            let mut guard = state.lock().await;
            if let Some(camera) = guard.known_devices.remove(&device_id)
                && let Err(e) = guard.runtime.teardown_camera(&camera).await
            {
                warn!(device_id, error = %e, "failed to tear down unassigned camera");
            }
        }
        Command::ShowWindow => {
            // Headless camera module has no UI surface to raise.
        }
        Command::UpdateRecordSettings { size, fps, enabled, .. } => {
            let guard = state.lock().await;
            let ids: Vec<CameraId> = guard.known_devices.values().cloned().collect();
            let mut settings = HashMap::new();
            if let Some(size) = size {
                settings.insert("record_resolution".to_string(), size);
            }
            if let Some(fps) = fps {
                settings.insert("preview_fps".to_string(), fps.to_string());
            }
            if let Some(enabled) = enabled {
                settings.insert("enabled".to_string(), enabled.to_string());
            }
            for id in ids {
                if let Err(e) = guard.runtime.apply_camera_config(&id, &settings).await {
                    warn!(camera = %id, error = %e, "failed to apply record settings");
                }
            }
        }
        Command::Quit => unreachable!("handled by the caller before dispatch"),
    }
}

/// Duplicates the real fd 1 out from under GStreamer before any pipeline is
/// built, then redirects the real fd 1 (and, once tracing no longer depends
/// on it, fd 2) to the log file or `/dev/null`. GStreamer elements that
/// `fprintf` straight to stdout/stderr land there instead of corrupting the
/// JSON status channel, which keeps writing through the duplicated fd.
fn protect_status_channel(log_file: Option<&PathBuf>) -> std::io::Result<()> {
    let status_fd: RawFd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if status_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let redirect_target = match log_file {
        Some(path) => std::fs::OpenOptions::new().create(true).append(true).open(path)?,
        None => std::fs::OpenOptions::new().write(true).open("/dev/null")?,
    };
    let redirect_fd = redirect_target.as_raw_fd();

    if unsafe { libc::dup2(redirect_fd, libc::STDOUT_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Tracing writes straight to an already-opened file handle when
    // `--log-file` is set, so it no longer reads or writes fd 2 by that
    // point; only then is it safe to also hand fd 2 to GStreamer.
    if log_file.is_some() && unsafe { libc::dup2(redirect_fd, libc::STDERR_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let status_file = unsafe { std::fs::File::from_raw_fd(status_fd) };
    let _ = STATUS_CHANNEL.set(Mutex::new(tokio::fs::File::from_std(status_file)));
    Ok(())
}

async fn emit_status(status: Status) {
    match encode_status(&status) {
        Ok(line) => {
            let bytes = format!("{line}\n").into_bytes();
            let result = match STATUS_CHANNEL.get() {
                Some(channel) => {
                    let mut file = channel.lock().await;
                    let res = file.write_all(&bytes).await;
                    if res.is_ok() {
                        let _ = file.flush().await;
                    }
                    res
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let res = stdout.write_all(&bytes).await;
                    if res.is_ok() {
                        let _ = stdout.flush().await;
                    }
                    res
                }
            };
            if let Err(e) = result {
                error!(error = %e, "failed to write status to the status channel");
            }
        }
        Err(e) => error!(error = %e, "failed to encode status"),
    }
}

fn init_logging(args: &Args) {
    let filter = args
        .log_level
        .as_deref()
        .map(|l| l.to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "warn".to_string());

    let builder = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).with_target(true).with_level(true);

    // stdout is reserved for the JSON status channel; logs always go to
    // stderr (or a file), never stdout.
    match &args.log_file {
        Some(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                builder.with_writer(std::sync::Mutex::new(file)).init();
            } else {
                builder.with_writer(std::io::stderr).init();
            }
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}
