// SPDX-License-Identifier: GPL-3.0-only

//! Module Supervisor: top-level coordinator. Owns every module child
//! process, the session lifecycle, and device-driven auto-wiring. Grounded
//! on `original_source/Modules/base/base_supervisor.py`'s retry-on-failure
//! `run()` loop (generalized: retries a module's child *process*, not an
//! in-process system object) and on
//! `original_source/rpi_logger/core/state_persistence.py`'s phase-gated
//! persistence handlers and recovery-file lifecycle.

pub mod discovery;

use crate::config::ConfigManager;
use crate::errors::{AppError, AppResult};
use crate::process::{Command, ModuleProcess, ProcessState};
use crate::tasks::TaskManager;
use discovery::DeviceEvent;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Static description of one module this supervisor can own. `multi_instance`
/// modules spawn one process per device (instance key `{name}:{device_key}`);
/// single-instance modules (e.g. the camera module, which fans one process
/// out over every locally attached camera) receive `assign_device`/
/// `unassign_device` commands instead.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub multi_instance: bool,
}

struct ModuleEntry {
    spec: ModuleSpec,
    enabled: bool,
    instances: HashMap<String, Arc<ModuleProcess>>,
}

impl ModuleEntry {
    fn new(spec: ModuleSpec) -> Self {
        Self {
            spec,
            enabled: false,
            instances: HashMap::new(),
        }
    }
}

struct EventLog {
    path: PathBuf,
}

impl EventLog {
    async fn start(session_dir: &Path, timestamp: &str) -> std::io::Result<Self> {
        let path = session_dir.join(format!("{timestamp}_CONTROL.csv"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, "timestamp,event_type,details\n").await?;
        Ok(Self { path })
    }

    async fn append(&self, event_type: &str, details: &str) {
        use tokio::io::AsyncWriteExt;
        let row = format!("{},{event_type},{details}\n", chrono::Utc::now().to_rfc3339());
        match tokio::fs::OpenOptions::new().append(true).open(&self.path).await {
            Ok(mut file) => {
                if let Err(e) = file.write_all(row.as_bytes()).await {
                    error!(path = %self.path.display(), error = %e, "failed to append control event");
                }
            }
            Err(e) => error!(path = %self.path.display(), error = %e, "failed to open control log"),
        }
    }
}

struct SessionState {
    dir: PathBuf,
    timestamp: String,
    event_log: EventLog,
    trial_counter: u32,
}

pub struct Supervisor {
    config: Arc<ConfigManager>,
    modules: Mutex<HashMap<String, ModuleEntry>>,
    tasks: TaskManager,
    session: Mutex<Option<SessionState>>,
    trial_active: AtomicBool,
    output_root: PathBuf,
    session_prefix: String,
    device_monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    devices: Mutex<HashMap<String, crate::camera::types::CameraId>>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigManager>, output_root: PathBuf, session_prefix: String) -> Self {
        Self {
            config,
            modules: Mutex::new(HashMap::new()),
            tasks: TaskManager::new(),
            session: Mutex::new(None),
            trial_active: AtomicBool::new(false),
            output_root,
            session_prefix,
            device_monitor: Mutex::new(None),
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_module(&self, spec: ModuleSpec) {
        self.modules.lock().await.insert(spec.name.clone(), ModuleEntry::new(spec));
    }

    /// Runs the startup sequence: union the recovery snapshot's enabled set
    /// with each module's persisted `enabled` flag, spawn what should run,
    /// enter `Running`, then save a fresh startup snapshot. Takes `self` as
    /// an `Arc` so the device-monitor consumer task can hold its own clone.
    pub async fn startup(self: &Arc<Self>) -> AppResult<()> {
        crate::config::paths::ensure_directories()?;

        let recovered = self.config.load_recovery_state().await;
        if let Some(names) = &recovered {
            info!(count = names.len(), "startup: restoring modules from recovery snapshot");
        }

        let names: Vec<String> = self.modules.lock().await.keys().cloned().collect();
        for name in names {
            let in_snapshot = recovered.as_ref().is_some_and(|snapshot| snapshot.contains(&name));
            let persisted_enabled = self.config.load_module_state(Some(&module_config_path(&name))).await.enabled;
            let should_enable = in_snapshot || persisted_enabled;
            if should_enable {
                if let Err(e) = self.set_module_enabled(&name, true).await {
                    warn!(module = %name, error = %e, "startup: failed to restore module");
                }
            }
        }

        if recovered.is_some() {
            self.config.delete_recovery_file().await;
        }

        self.config.enter_running_phase();

        let running = self.running_module_names().await;
        self.config.save_startup_snapshot(&running.into_iter().collect()).await;

        let (rx, handle) = discovery::spawn_camera_monitor();
        *self.device_monitor.lock().await = Some(handle);
        let consumer = self.clone();
        self.tasks.spawn("device-monitor-consumer", Self::consume_device_events(consumer, rx)).await;

        Ok(())
    }

    async fn consume_device_events(supervisor: Arc<Supervisor>, mut rx: tokio::sync::mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = rx.recv().await {
            supervisor.handle_device_event(event).await;
        }
    }

    /// Enables or disables a module. Enabling a not-yet-running
    /// single-instance module spawns its one process and a background task
    /// pumping its status channel. Disabling stops every instance and clears
    /// the enabled flag. A no-op if already in the requested state
    /// (idempotent, per the spec's testable property).
    pub async fn set_module_enabled(self: &Arc<Self>, name: &str, enabled: bool) -> AppResult<()> {
        let spawned = {
            let mut modules = self.modules.lock().await;
            let entry = modules.get_mut(name).ok_or_else(|| AppError::DeviceNotFound(name.to_string()))?;

            if entry.enabled == enabled {
                return Ok(());
            }
            entry.enabled = enabled;

            let mut spawned = None;
            if enabled {
                if !entry.spec.multi_instance && entry.instances.is_empty() {
                    let process = self.spawn_instance(&entry.spec, name).await?;
                    entry.instances.insert(name.to_string(), process.clone());
                    spawned = Some(process);
                }
            } else {
                for (_, process) in entry.instances.drain() {
                    process.stop().await;
                }
            }
            spawned
        };

        if let Some(process) = spawned {
            let supervisor = self.clone();
            let module = name.to_string();
            self.tasks
                .spawn(format!("pump:{module}"), async move {
                    let instance_id = module.clone();
                    supervisor.pump_instance_status(&module, &instance_id, process).await;
                })
                .await;
        }
        Ok(())
    }

    async fn spawn_instance(&self, spec: &ModuleSpec, instance_id: &str) -> AppResult<Arc<ModuleProcess>> {
        let log_path = crate::config::paths::user_module_logs_dir().join(format!("{instance_id}.log"));
        let process = ModuleProcess::spawn(instance_id, &spec.program, &spec.args, log_path).await?;
        process.await_start().await?;
        info!(module = %instance_id, "module started");
        Ok(Arc::new(process))
    }

    pub async fn handle_device_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected { device_key, camera } => {
                self.devices.lock().await.insert(device_key.clone(), camera);
                self.config.on_device_connected("Cameras", &module_config_path("Cameras")).await;
                if let Some(process) = self.instance_for("Cameras", "Cameras").await {
                    let _ = process
                        .send(Command::AssignDevice {
                            device_id: device_key,
                            device_type: "camera".to_string(),
                            port: None,
                            baudrate: None,
                            session_dir: self.session.lock().await.as_ref().map(|s| s.dir.to_string_lossy().to_string()),
                            is_wireless: false,
                        })
                        .await;
                } else if self.is_enabled("Cameras").await {
                    if let Err(e) = self.set_module_enabled("Cameras", true).await {
                        warn!(error = %e, "failed to start Cameras module on device connect");
                    }
                }
            }
            DeviceEvent::Disconnected { device_key } => {
                self.devices.lock().await.remove(&device_key);
                if let Some(process) = self.instance_for("Cameras", "Cameras").await {
                    let _ = process.send(Command::UnassignDevice { device_id: device_key }).await;
                }
            }
        }
    }

    async fn is_enabled(&self, name: &str) -> bool {
        self.modules.lock().await.get(name).map(|e| e.enabled).unwrap_or(false)
    }

    async fn instance_for(&self, module: &str, instance_id: &str) -> Option<Arc<ModuleProcess>> {
        self.modules.lock().await.get(module)?.instances.get(instance_id).cloned()
    }

    /// Creates the timestamped session directory, starts the control event
    /// log, and broadcasts `start_session` to every running module.
    pub async fn start_session(&self) -> AppResult<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = crate::session::create_session_dir(&self.output_root, &self.session_prefix, &timestamp, false)?;

        let event_log = EventLog::start(&dir, &timestamp)
            .await
            .map_err(|e| AppError::ConfigWriteError(e.to_string()))?;
        event_log.append("session_start", &dir.display().to_string()).await;

        *self.session.lock().await = Some(SessionState {
            dir: dir.clone(),
            timestamp,
            event_log,
            trial_counter: 0,
        });

        self.broadcast(Command::StartSession {
            session_dir: dir.to_string_lossy().to_string(),
        })
        .await;

        Ok(dir)
    }

    pub async fn stop_session(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        self.broadcast(Command::StopSession).await;
        session.event_log.append("session_stop", "").await;
    }

    pub async fn trial_active(&self) -> bool {
        self.trial_active.load(Ordering::SeqCst)
    }

    /// Broadcasts `start_recording` to every running module with the next
    /// trial number. Returns the trial number assigned.
    pub async fn start_trial(&self, label: Option<String>) -> AppResult<u32> {
        let trial_number = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or_else(|| AppError::StateTransitionError("no active session".to_string()))?;
            session.trial_counter += 1;
            let n = session.trial_counter;
            session
                .event_log
                .append("trial_start", &format!("trial={n} label={}", label.clone().unwrap_or_default()))
                .await;
            n
        };

        self.trial_active.store(true, Ordering::SeqCst);
        self.broadcast(Command::StartRecording { trial_number, label }).await;
        Ok(trial_number)
    }

    pub async fn stop_trial(&self) {
        if !self.trial_active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.broadcast(Command::StopRecording).await;
        if let Some(session) = self.session.lock().await.as_ref() {
            session.event_log.append("trial_stop", "").await;
        }
    }

    /// Fire-and-forget dispatch to a single named module's one instance
    /// (single-instance modules only; use `send_instance_command` for
    /// multi-instance ones).
    pub async fn send_module_command(&self, name: &str, command: Command) -> AppResult<()> {
        let process = self.instance_for(name, name).await.ok_or_else(|| AppError::DeviceNotFound(name.to_string()))?;
        process.send(command).await
    }

    pub async fn send_instance_command(&self, module: &str, instance_id: &str, command: Command) -> AppResult<()> {
        let process = self.instance_for(module, instance_id).await.ok_or_else(|| AppError::DeviceNotFound(instance_id.to_string()))?;
        process.send(command).await
    }

    /// Broadcasts fire concurrently; per-module failures are logged and do
    /// not roll back other modules' broadcasts.
    async fn broadcast(&self, command: Command) {
        let processes: Vec<(String, Arc<ModuleProcess>)> = {
            let modules = self.modules.lock().await;
            modules
                .values()
                .flat_map(|entry| entry.instances.iter().map(|(id, p)| (id.clone(), p.clone())))
                .collect()
        };

        let mut sends = Vec::new();
        for (id, process) in processes {
            let command = command.clone();
            sends.push(async move {
                if let Err(e) = process.send(command).await {
                    warn!(instance = %id, error = %e, "broadcast command failed");
                }
            });
        }
        futures::future::join_all(sends).await;
    }

    pub async fn running_module_names(&self) -> Vec<String> {
        self.modules
            .lock()
            .await
            .iter()
            .filter(|(_, e)| !e.instances.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Gracefully stops every instance of a module and clears its enabled
    /// flag, without touching other modules. Returns the stopped instances
    /// so the caller can inspect `was_forcefully_stopped()` before they're
    /// dropped.
    pub async fn stop_module(&self, name: &str) -> AppResult<Vec<Arc<ModuleProcess>>> {
        let mut modules = self.modules.lock().await;
        let entry = modules.get_mut(name).ok_or_else(|| AppError::DeviceNotFound(name.to_string()))?;
        entry.enabled = false;
        let mut stopped = Vec::new();
        for (_, process) in entry.instances.drain() {
            process.stop().await;
            stopped.push(process);
        }
        Ok(stopped)
    }

    /// True if no tracked module instance crashed or had to be forcefully
    /// killed this run, per the shutdown coordinator's recovery-file policy.
    pub async fn all_modules_clean(&self) -> bool {
        let modules = self.modules.lock().await;
        !modules.values().flat_map(|e| e.instances.values()).any(|p| p.was_forcefully_stopped() || p.state() == ProcessState::Crashed)
    }

    /// Drives the status fan-in loop for one module instance: reads status
    /// lines until the child exits, updating recovery policy on crash/quit.
    /// Call once per spawned instance (the supervisor binary spawns this as
    /// a named task per instance).
    pub async fn pump_instance_status(&self, module: &str, instance_id: &str, process: Arc<ModuleProcess>) {
        loop {
            let Some(status) = process.next_status().await else { break };
            if status.is_quitting() {
                info!(module, instance = instance_id, "module reported quitting");
                self.config.on_internal_module_closed(module, &module_config_path(module)).await;
                break;
            }
            if status.is_error() {
                warn!(module, instance = instance_id, data = %status.data, "module reported error status");
            }
        }

        if process.state() == ProcessState::Crashed {
            self.config.on_module_crash(module, &module_config_path(module)).await;
            if let Some(entry) = self.modules.lock().await.get_mut(module) {
                entry.enabled = false;
                entry.instances.remove(instance_id);
            }
        }
    }
}

fn module_config_path(module: &str) -> PathBuf {
    crate::config::paths::user_module_config_dir().join(format!("{module}.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<ConfigManager> {
        Arc::new(ConfigManager::new())
    }

    #[tokio::test]
    async fn set_module_enabled_is_idempotent_when_module_unknown() {
        let supervisor = Arc::new(Supervisor::new(test_config(), std::env::temp_dir(), "pilot".to_string()));
        let result = supervisor.set_module_enabled("missing", true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_trial_requires_active_session() {
        let supervisor = Supervisor::new(test_config(), std::env::temp_dir(), "pilot".to_string());
        let result = supervisor.start_trial(None).await;
        assert!(matches!(result, Err(AppError::StateTransitionError(_))));
    }

    #[tokio::test]
    async fn start_session_then_trial_increments_counter() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(), dir.path().to_path_buf(), "pilot".to_string());
        supervisor.start_session().await.unwrap();
        let n1 = supervisor.start_trial(Some("T1".to_string())).await.unwrap();
        supervisor.stop_trial().await;
        let n2 = supervisor.start_trial(None).await.unwrap();
        assert_eq!(n1, 1);
        assert_eq!(n2, 2);
    }
}
