// SPDX-License-Identifier: GPL-3.0-only

//! Supervisor binary: owns the module fleet and the session/trial lifecycle.
//! Mode handling (`interactive`/`demo`/headless) is grounded on
//! `original_source/unified_master.py`'s `interactive_mode`/`demo_mode` split,
//! translated into an async command loop instead of blocking `input()`.

use clap::Parser;
use session_capture::cli::{Cli, RunMode, EXIT_FATAL, EXIT_INTERRUPTED, EXIT_OK};
use session_capture::config::ConfigManager;
use session_capture::session::sanitize_path_component;
use session_capture::shutdown;
use session_capture::supervisor::{ModuleSpec, Supervisor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const DEMO_DURATION: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let interrupted = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(tokio::sync::Notify::new());
    if let Err(e) = shutdown::install_signal_handler(interrupted.clone(), notify.clone()) {
        error!(error = %e, "failed to install signal handler");
        std::process::exit(EXIT_FATAL);
    }

    let config = Arc::new(ConfigManager::new());
    let session_prefix = sanitize_path_component(&cli.session_prefix);
    let supervisor = Arc::new(Supervisor::new(config.clone(), cli.output_dir.clone(), session_prefix));

    supervisor.register_module(camera_module_spec()).await;

    if let Err(e) = supervisor.startup().await {
        error!(error = %e, "fatal error during startup");
        std::process::exit(EXIT_FATAL);
    }
    info!(mode = ?cli.mode, "supervisor started");

    if cli.auto_start_recording_enabled() {
        match supervisor.start_session().await {
            Ok(dir) => {
                info!(session_dir = %dir.display(), "auto-started session");
                if let Err(e) = supervisor.start_trial(None).await {
                    warn!(error = %e, "auto-start-recording: failed to start trial");
                }
            }
            Err(e) => warn!(error = %e, "auto-start-recording: failed to start session"),
        }
    }

    match cli.mode {
        RunMode::Interactive => {
            let supervisor = supervisor.clone();
            let notify = notify.clone();
            tokio::spawn(run_interactive(supervisor, notify));
        }
        RunMode::Demo => {
            let notify = notify.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DEMO_DURATION).await;
                notify.notify_one();
            });
        }
        RunMode::Gui => {
            warn!("gui mode has no local window surface in this build; running headless");
        }
        RunMode::Headless | RunMode::Slave => {}
    }

    notify.notified().await;

    shutdown::shutdown(&supervisor, &config).await;

    let code = if interrupted.load(Ordering::SeqCst) { EXIT_INTERRUPTED } else { EXIT_OK };
    std::process::exit(code);
}

fn camera_module_spec() -> ModuleSpec {
    let program = sibling_binary_path("camera-module");
    ModuleSpec {
        name: "Cameras".to_string(),
        program: program.to_string_lossy().to_string(),
        args: Vec::new(),
        multi_instance: false,
    }
}

/// Resolves a module binary installed next to this one, matching how
/// `unified_master.py` launches its child modules as sibling scripts.
fn sibling_binary_path(name: &str) -> std::path::PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| std::path::PathBuf::from(name))
}

async fn run_interactive(supervisor: Arc<Supervisor>, notify: Arc<tokio::sync::Notify>) {
    println!("commands: start | stop | status | quit");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        match line.trim() {
            "start" | "record" | "r" => match supervisor.start_trial(None).await {
                Ok(n) => println!("trial {n} started"),
                Err(e) => println!("error: {e}"),
            },
            "stop" | "s" => {
                supervisor.stop_trial().await;
                println!("trial stopped");
            }
            "status" | "stat" => {
                let running = supervisor.running_module_names().await;
                println!("running modules: {}", running.join(", "));
            }
            "quit" | "q" | "exit" => {
                notify.notify_one();
                break;
            }
            "" => continue,
            other => println!("unknown command: {other}"),
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = cli
        .log_level
        .map(|l| l.as_filter_directive().to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let builder = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).with_target(true).with_level(true);

    match &cli.log_file {
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
