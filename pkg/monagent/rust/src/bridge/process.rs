// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::BridgeError;
use super::config::{BridgeSettings, LaunchConfig, write_descriptors};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::time::{Duration, timeout};

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Refresh the descriptors and spawn one bridge process.
pub(crate) fn spawn(settings: &BridgeSettings, launch: &LaunchConfig) -> Result<Child, BridgeError> {
    write_descriptors(&launch.config_dir, &settings.targets)?;

    let mut cmd = Command::new(&settings.command);
    cmd.args(&settings.args);
    cmd.args(launch.launch_args());

    for (k, v) in &settings.env {
        cmd.env(k, v);
    }
    for (k, v) in launch.launch_env() {
        cmd.env(k, v);
    }

    if let Some(ref dir) = settings.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdout(stdio_from_str(&settings.stdout));
    cmd.stderr(stdio_from_str(&settings.stderr));
    // An abandoned watcher must not leave the bridge behind.
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| BridgeError::Spawn {
        command: settings.command.clone(),
        source,
    })?;

    info!(
        "[bridge] spawned (pid={}, cmd={})",
        child.id().unwrap_or(0),
        settings.command
    );
    Ok(child)
}

pub(crate) fn send_signal(child: &Child, sig: Signal) {
    if let Some(pid) = child.id()
        && let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig)
    {
        warn!("[bridge] failed to send {sig}: {e}");
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    info!("[bridge] sending SIGTERM");
    send_signal(child, Signal::SIGTERM);
    if let Ok(res) = timeout(grace, child.wait()).await {
        return log_exit(res);
    }

    warn!(
        "[bridge] stop timeout ({}ms) reached, sending SIGKILL",
        grace.as_millis()
    );
    send_signal(child, Signal::SIGKILL);
    match timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(res) => log_exit(res),
        Err(_) => {
            warn!("[bridge] process did not exit after SIGKILL");
            None
        }
    }
}

/// Upper bound on how long [`terminate`] can take.
pub(crate) fn terminate_budget(grace: Duration) -> Duration {
    grace + KILL_TIMEOUT + Duration::from_secs(1)
}

fn log_exit(res: std::io::Result<ExitStatus>) -> Option<ExitStatus> {
    match res {
        Ok(status) => {
            info!("[bridge] exited with {status}");
            Some(status)
        }
        Err(e) => {
            warn!("[bridge] failed to wait on process: {e}");
            None
        }
    }
}

fn stdio_from_str(s: &str) -> Stdio {
    match s {
        "null" => Stdio::null(),
        _ => Stdio::inherit(),
    }
}
