// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervision of the external collector process ("bridge") that polls
//! remote targets and reports back over statsd.

pub mod config;
mod process;
pub mod state;
mod supervisor;

pub use config::{BridgeLogging, BridgeSettings, BridgeTarget, LaunchConfig, RestartPolicy};
pub use state::BridgeState;
pub use supervisor::{Alerter, BridgeSupervisor, LogAlerter};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge command is empty")]
    EmptyCommand,
    #[error("invalid bridge target name {0:?}")]
    InvalidTarget(String),
    #[error("writing bridge descriptors at {path}: {source}")]
    Descriptors {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing bridge descriptor: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
