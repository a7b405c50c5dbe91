// SPDX-License-Identifier: GPL-3.0-only

//! Module Process abstraction: the wire protocol and the child-process
//! handle that speaks it.

pub mod module_process;
pub mod wire;

pub use module_process::{ModuleProcess, ProcessState};
pub use wire::{Command, ParsedCommand, Status};
