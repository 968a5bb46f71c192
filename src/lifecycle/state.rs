use std::fmt;

use serde::Serialize;

/// Where an instance is, inferred from disk and the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "pid")]
pub enum InstanceState {
    Absent,
    Disabled,
    Stopped,
    Running(u32),
    /// A matching process exists but the caller may not signal it.
    Unauthorized(u32),
}

impl InstanceState {
    pub fn pid(self) -> Option<u32> {
        match self {
            InstanceState::Running(pid) | InstanceState::Unauthorized(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InstanceState::Absent => "absent",
            InstanceState::Disabled => "disabled",
            InstanceState::Stopped => "stopped",
            InstanceState::Running(_) => "running",
            InstanceState::Unauthorized(_) => "unauthorized",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a transition did. "Already there" results are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started(Option<u32>),
    AlreadyRunning(u32),
    Stopped,
    Killed,
    NotRunning,
    /// Restart left a stopped instance alone.
    Skipped,
    Disabled,
    Enabled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Started(Some(pid)) => write!(f, "started (pid {pid})"),
            Outcome::Started(None) => f.write_str("started"),
            Outcome::AlreadyRunning(pid) => write!(f, "already running (pid {pid})"),
            Outcome::Stopped => f.write_str("stopped"),
            Outcome::Killed => f.write_str("killed"),
            Outcome::NotRunning => f.write_str("not running"),
            Outcome::Skipped => f.write_str("not running, left stopped"),
            Outcome::Disabled => f.write_str("disabled"),
            Outcome::Enabled => f.write_str("enabled"),
        }
    }
}
