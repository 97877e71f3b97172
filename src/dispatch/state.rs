use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GroupMailError;

/// Run state of a dispatch scheduler.
///
/// IDLE → RUNNING → {PAUSED, COMPLETED, ABORTED}; PAUSED → RUNNING | ABORTED.
/// COMPLETED and ABORTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "IDLE"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Paused => write!(f, "PAUSED"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Events that move a run between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Cancel,
    /// Every job reached a terminal attempt.
    Finish,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Cancel => "cancel",
            Command::Finish => "finish",
        };
        write!(f, "{name}")
    }
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }

    /// Compute the state reached by applying `command`, or reject it.
    pub fn apply(self, command: Command) -> Result<RunState, GroupMailError> {
        let next = match (self, command) {
            (RunState::Idle, Command::Start) => RunState::Running,
            (RunState::Running, Command::Pause) => RunState::Paused,
            (RunState::Running, Command::Cancel) => RunState::Aborted,
            (RunState::Running, Command::Finish) => RunState::Completed,
            (RunState::Paused, Command::Resume) => RunState::Running,
            (RunState::Paused, Command::Cancel) => RunState::Aborted,
            (state, command) => {
                return Err(GroupMailError::invalid_operation(format!(
                    "cannot {command} while {state}"
                )));
            }
        };
        Ok(next)
    }

    /// State to adopt when loading a persisted snapshot. A run persisted as
    /// RUNNING belonged to a process that died mid-flight.
    pub fn on_restore(self) -> RunState {
        match self {
            RunState::Running => RunState::Paused,
            other => other,
        }
    }
}
