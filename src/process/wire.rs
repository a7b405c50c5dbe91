// SPDX-License-Identifier: GPL-3.0-only

//! Command/status wire protocol: newline-delimited JSON exchanged with a
//! module's child process over stdin/stdout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A command sent from the supervisor to a module child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartSession {
        session_dir: String,
    },
    StopSession,
    StartRecording {
        trial_number: u32,
        label: Option<String>,
    },
    StopRecording,
    GetStatus,
    AssignDevice {
        device_id: String,
        device_type: String,
        port: Option<String>,
        baudrate: Option<u32>,
        session_dir: Option<String>,
        is_wireless: bool,
    },
    UnassignDevice {
        device_id: String,
    },
    ShowWindow,
    UpdateRecordSettings {
        #[serde(default)]
        size: Option<String>,
        #[serde(default)]
        fps: Option<f64>,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        quality: Option<String>,
        #[serde(default)]
        enabled: Option<bool>,
        #[serde(default)]
        directory: Option<String>,
    },
    Quit,
}

/// A decoded command line: either one of the fixed verbs above or a
/// module-specific one the wire protocol doesn't name.
#[derive(Debug, Clone)]
pub enum ParsedCommand {
    Known(Command),
    Other { command: String, kwargs: HashMap<String, serde_json::Value> },
}

/// A status line emitted by a module child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Status {
    pub fn new(status: impl Into<String>, data: serde_json::Value) -> Self {
        Self { status: status.into(), data }
    }

    pub fn is_quitting(&self) -> bool {
        self.status == "quitting"
    }

    pub fn is_initialized(&self) -> bool {
        self.status == "initialized"
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

pub fn encode_command(command: &Command) -> serde_json::Result<String> {
    serde_json::to_string(command)
}

/// Decodes a command line, falling back to `ParsedCommand::Other` for
/// module-specific verbs not in the fixed vocabulary.
pub fn decode_command(line: &str) -> serde_json::Result<ParsedCommand> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if let Ok(known) = serde_json::from_value::<Command>(value.clone()) {
        return Ok(ParsedCommand::Known(known));
    }
    let command = value.get("command").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let mut kwargs = HashMap::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            if k != "command" {
                kwargs.insert(k, v);
            }
        }
    }
    Ok(ParsedCommand::Other { command, kwargs })
}

pub fn encode_status(status: &Status) -> serde_json::Result<String> {
    serde_json::to_string(status)
}

pub fn decode_status(line: &str) -> serde_json::Result<Status> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_session_round_trips() {
        let cmd = Command::StartSession {
            session_dir: "/tmp/x".to_string(),
        };
        let line = encode_command(&cmd).unwrap();
        assert!(line.contains("start_session"));
        let decoded = decode_command(&line).unwrap();
        assert!(matches!(decoded, ParsedCommand::Known(Command::StartSession { .. })));
    }

    #[test]
    fn quit_round_trips_without_fields() {
        let line = encode_command(&Command::Quit).unwrap();
        let decoded = decode_command(&line).unwrap();
        assert!(matches!(decoded, ParsedCommand::Known(Command::Quit)));
    }

    #[test]
    fn module_specific_verb_falls_back_to_other() {
        let decoded = decode_command(r#"{"command":"calibrate","gain":3}"#).unwrap();
        match decoded {
            ParsedCommand::Other { command, kwargs } => {
                assert_eq!(command, "calibrate");
                assert_eq!(kwargs["gain"], 3);
            }
            _ => panic!("expected Other"),
        }
    }

    #[test]
    fn status_report_round_trips_with_free_form_data() {
        let status = Status::new("status_report", serde_json::json!({"state": "idle", "recording": false}));
        let line = encode_status(&status).unwrap();
        let decoded = decode_status(&line).unwrap();
        assert_eq!(decoded.status, "status_report");
        assert_eq!(decoded.data["state"], "idle");
    }

    #[test]
    fn quitting_and_error_are_recognized() {
        assert!(Status::new("quitting", serde_json::json!({})).is_quitting());
        assert!(Status::new("error", serde_json::json!({})).is_error());
    }
}
