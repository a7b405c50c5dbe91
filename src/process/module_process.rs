// SPDX-License-Identifier: GPL-3.0-only

//! Module Process: owns one module's child OS process and the line-delimited
//! JSON channel to it. Grounded on `original_source/Modules/base/io_utils.py`'s
//! `AnsiStripWriter`/`redirect_stderr_stdout` for stderr-to-logfile capture,
//! generalized from an in-process redirect to a piped child's stderr stream.

use crate::process::wire::{decode_status, encode_command, Command, Status};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const START_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Initializing,
    Idle,
    Recording,
    Error,
    Crashed,
}

/// Strips ANSI escape sequences before writing a line to the module log.
struct AnsiStripWriter {
    file: tokio::fs::File,
}

impl AnsiStripWriter {
    async fn open(log_path: &std::path::Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(log_path).await?;
        Ok(Self { file })
    }

    async fn write_line(&mut self, line: &str) {
        let stripped = strip_ansi(line);
        if let Err(e) = self.file.write_all(format!("{stripped}\n").as_bytes()).await {
            error!(error = %e, "failed to write module log line");
        }
    }
}

fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// A live child module process: the command writer, status reader, and
/// stderr-to-logfile pump all run as tasks owned by this handle.
pub struct ModuleProcess {
    name: String,
    child: Mutex<Option<Child>>,
    stdin_tx: mpsc::Sender<Command>,
    state: Arc<std::sync::Mutex<ProcessState>>,
    forcefully_stopped: Arc<AtomicBool>,
    saw_quitting: Arc<AtomicBool>,
    status_rx: Mutex<mpsc::Receiver<Status>>,
}

impl ModuleProcess {
    /// Spawns `program` with `args`, wiring stdin/stdout as the JSON command
    /// channel and stderr to `log_path` (ANSI-stripped).
    pub async fn spawn(name: &str, program: &str, args: &[String], log_path: PathBuf) -> crate::errors::AppResult<Self> {
        let mut child = TokioCommand::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(crate::errors::AppError::from)?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Command>(32);
        let (status_tx, status_rx) = mpsc::channel::<Status>(64);

        let state = Arc::new(std::sync::Mutex::new(ProcessState::Starting));
        let saw_quitting = Arc::new(AtomicBool::new(false));

        let writer_name = name.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = stdin_rx.recv().await {
                let Ok(line) = encode_command(&cmd) else {
                    warn!(module = %writer_name, "failed to encode command");
                    continue;
                };
                if let Err(e) = stdin.write_all(format!("{line}\n").as_bytes()).await {
                    warn!(module = %writer_name, error = %e, "stdin write failed, child likely gone");
                    break;
                }
            }
        });

        let reader_name = name.to_string();
        let reader_state = state.clone();
        let reader_quitting = saw_quitting.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_status(&line) {
                            Ok(status) => {
                                if status.is_quitting() {
                                    reader_quitting.store(true, Ordering::SeqCst);
                                }
                                update_state_from_status(&reader_state, &status);
                                if status_tx.send(status).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(module = %reader_name, error = %e, line, "malformed status line"),
                        }
                    }
                    Ok(None) => {
                        debug!(module = %reader_name, "stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(module = %reader_name, error = %e, "status reader error");
                        break;
                    }
                }
            }
        });

        let log_name = name.to_string();
        tokio::spawn(async move {
            let mut writer = match AnsiStripWriter::open(&log_path).await {
                Ok(w) => w,
                Err(e) => {
                    error!(module = %log_name, error = %e, "failed to open module log file");
                    return;
                }
            };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                writer.write_line(&line).await;
            }
        });

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin_tx,
            state,
            forcefully_stopped: Arc::new(AtomicBool::new(false)),
            saw_quitting,
            status_rx: Mutex::new(status_rx),
        })
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }

    pub fn was_forcefully_stopped(&self) -> bool {
        self.forcefully_stopped.load(Ordering::SeqCst)
    }

    /// Awaits the first status line within `start_timeout`, transitioning
    /// `Starting` to `Initializing`/`Idle` or to `Error` on timeout.
    pub async fn await_start(&self) -> crate::errors::AppResult<()> {
        let mut rx = self.status_rx.lock().await;
        match timeout(START_TIMEOUT, rx.recv()).await {
            Ok(Some(_status)) => Ok(()),
            Ok(None) => {
                *self.state.lock().unwrap() = ProcessState::Error;
                Err(crate::errors::AppError::StateTransitionError(format!("{} exited before reporting status", self.name)))
            }
            Err(_) => {
                *self.state.lock().unwrap() = ProcessState::Error;
                Err(crate::errors::AppError::Timeout(format!("{} did not report status within start_timeout", self.name)))
            }
        }
    }

    pub async fn next_status(&self) -> Option<Status> {
        self.status_rx.lock().await.recv().await
    }

    pub async fn send(&self, command: Command) -> crate::errors::AppResult<()> {
        self.stdin_tx
            .send(command)
            .await
            .map_err(|_| crate::errors::AppError::CommandProtocolError(format!("{} stdin channel closed", self.name)))
    }

    /// Graceful stop sequence: `quit` -> wait -> SIGTERM -> wait -> SIGKILL.
    /// Any forced signal marks the module `forcefully_stopped`.
    pub async fn stop(&self) {
        let _ = self.send(Command::Quit).await;

        if self.wait_for_exit(STOP_TIMEOUT).await {
            return;
        }

        warn!(module = %self.name, "did not exit after quit, sending SIGTERM");
        self.signal(libc::SIGTERM);
        if self.wait_for_exit(KILL_GRACE).await {
            self.forcefully_stopped.store(true, Ordering::SeqCst);
            return;
        }

        warn!(module = %self.name, "did not exit after SIGTERM, sending SIGKILL");
        self.signal(libc::SIGKILL);
        let _ = self.wait_for_exit(KILL_GRACE).await;
        self.forcefully_stopped.store(true, Ordering::SeqCst);
    }

    fn signal(&self, sig: i32) {
        if let Ok(mut guard) = self.child.try_lock()
            && let Some(child) = guard.as_mut()
            && let Some(pid) = child.id()
        {
            unsafe {
                libc::kill(pid as i32, sig);
            }
        }
    }

    async fn wait_for_exit(&self, dur: Duration) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else { return true };
        match timeout(dur, child.wait()).await {
            Ok(Ok(exit_status)) => {
                self.finalize_exit(exit_status.success());
                *guard = None;
                true
            }
            Ok(Err(e)) => {
                error!(module = %self.name, error = %e, "error waiting on child");
                false
            }
            Err(_) => false,
        }
    }

    fn finalize_exit(&self, clean: bool) {
        let mut state = self.state.lock().unwrap();
        *state = if self.saw_quitting.load(Ordering::SeqCst) || (*state == ProcessState::Starting && clean) {
            ProcessState::Stopped
        } else if *state == ProcessState::Starting {
            ProcessState::Error
        } else {
            ProcessState::Crashed
        };
    }
}

fn update_state_from_status(state: &Arc<std::sync::Mutex<ProcessState>>, status: &Status) {
    let mut s = state.lock().unwrap();
    match status.status.as_str() {
        "initializing" => *s = ProcessState::Initializing,
        "initialized" | "recording_stopped" => *s = ProcessState::Idle,
        "recording_started" => *s = ProcessState::Recording,
        "error" => *s = ProcessState::Error,
        "quitting" | "shutdown_started" => {}
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        let input = "\u{1b}[31merror\u{1b}[0m: bad thing";
        assert_eq!(strip_ansi(input), "error: bad thing");
    }

    #[test]
    fn strip_ansi_is_noop_on_plain_text() {
        assert_eq!(strip_ansi("plain log line"), "plain log line");
    }

    #[tokio::test]
    async fn spawned_echo_process_reports_status() {
        let script = "while read -r line; do echo '{\"status\":\"initialized\",\"data\":{\"ready_ms\":1}}'; done";
        let log_path = std::env::temp_dir().join(format!("module-process-test-{}.log", std::process::id()));
        let process = ModuleProcess::spawn("echo-test", "sh", &["-c".to_string(), script.to_string()], log_path.clone())
            .await
            .unwrap();

        process.send(Command::GetStatus).await.unwrap();
        let status = process.next_status().await.unwrap();
        assert_eq!(status.status, "initialized");
        assert_eq!(process.state(), ProcessState::Idle);

        process.stop().await;
        let _ = tokio::fs::remove_file(&log_path).await;
    }
}
