//! Container lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Requested,
    Provisioning,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Requested => "requested",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
            LifecycleState::Destroyed => "destroyed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }

    /// Whether a port stays reserved for an instance in this state.
    pub fn holds_port(&self) -> bool {
        matches!(
            self,
            LifecycleState::Provisioning | LifecycleState::Running | LifecycleState::Stopped
        )
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Requested, Provisioning) => true,
            (Provisioning, Running) | (Provisioning, Failed) => true,
            (Running, Stopped) | (Running, Failed) | (Running, Running) => true,
            (Stopped, Running) => true,
            (Failed, Provisioning) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "requested" => LifecycleState::Requested,
            "provisioning" => LifecycleState::Provisioning,
            "running" => LifecycleState::Running,
            "stopped" => LifecycleState::Stopped,
            "failed" => LifecycleState::Failed,
            "destroyed" => LifecycleState::Destroyed,
            other => return Err(format!("unknown lifecycle state '{}'", other)),
        })
    }
}

/// Caller-issued lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Provision,
    Start,
    Stop,
    Restart,
    Destroy,
}

impl LifecycleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCommand::Provision => "provision",
            LifecycleCommand::Start => "start",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Restart => "restart",
            LifecycleCommand::Destroy => "destroy",
        }
    }

    /// States from which this command may be issued.
    pub fn allowed_from(&self, state: LifecycleState) -> bool {
        use LifecycleState::*;
        match self {
            LifecycleCommand::Provision => matches!(state, Requested | Failed),
            LifecycleCommand::Start => state == Stopped,
            LifecycleCommand::Stop => state == Running,
            LifecycleCommand::Restart => matches!(state, Running | Stopped),
            LifecycleCommand::Destroy => !state.is_terminal(),
        }
    }
}
