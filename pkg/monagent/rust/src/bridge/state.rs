// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// `init` never called.
    Uninitialized,
    /// Descriptors being written and the process being spawned.
    Initializing,
    /// Bridge process is alive.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Not running, by request or because retries ran out.
    Stopped,
    /// Spawn failed or the process exited on its own; a restart may follow.
    Failed,
}

impl BridgeState {
    pub fn is_alive(self) -> bool {
        self == BridgeState::Running
    }

    pub(crate) fn can_transition_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Uninitialized, Stopped)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Initializing)
                | (Failed, Stopping)
                | (Failed, Stopped)
                | (Stopped, Initializing)
                | (Stopped, Stopped)
        )
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Uninitialized => write!(f, "uninitialized"),
            BridgeState::Initializing => write!(f, "initializing"),
            BridgeState::Running => write!(f, "running"),
            BridgeState::Stopping => write!(f, "stopping"),
            BridgeState::Stopped => write!(f, "stopped"),
            BridgeState::Failed => write!(f, "failed"),
        }
    }
}
